//! Four-detector outlier ensemble. A value is reported when at least two of
//! IQR fencing, z-score, isolation forest and LOF agree.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use smallvec::SmallVec;

use super::descriptive::{mean, population_std_dev, quantile, sorted_copy};

pub const ENSEMBLE_VOTES: usize = 2;
pub const Z_THRESHOLD: f64 = 3.0;
pub const LOF_NEIGHBORS: usize = 5;
pub const LOF_THRESHOLD: f64 = 1.5;
pub const ISOLATION_TREES: usize = 100;
pub const ISOLATION_SAMPLE: usize = 256;
pub const ISOLATION_THRESHOLD: f64 = 0.6;
const ISOLATION_SEED: u64 = 0x5eed_f0e5;
const EULER_GAMMA: f64 = 0.5772;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierMethod {
    Iqr,
    ZScore,
    IsolationForest,
    Lof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_z(z: f64) -> Self {
        let z = z.abs();
        if z > 5.0 {
            Severity::Critical
        } else if z > 4.0 {
            Severity::High
        } else if z > 3.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyRecord {
    /// Row index within the analysed data rows.
    pub index: usize,
    pub value: f64,
    pub methods: SmallVec<[OutlierMethod; 4]>,
    pub severity: Severity,
    pub z_score: f64,
}

/// Per-method flags plus the ensemble decision.
#[derive(Debug, Clone, Default)]
pub struct OutlierReport {
    pub iqr: Vec<bool>,
    pub z_score: Vec<bool>,
    pub isolation: Vec<bool>,
    pub lof: Vec<bool>,
    pub anomalies: Vec<AnomalyRecord>,
}

pub fn iqr_flags(values: &[f64]) -> Vec<bool> {
    let sorted = sorted_copy(values);
    let q1 = quantile(&sorted, 0.25);
    let q3 = quantile(&sorted, 0.75);
    let iqr = q3 - q1;
    let (lower, upper) = (q1 - 1.5 * iqr, q3 + 1.5 * iqr);
    values.iter().map(|v| *v < lower || *v > upper).collect()
}

pub fn z_scores(values: &[f64]) -> Vec<f64> {
    let m = mean(values);
    let s = population_std_dev(values);
    if s <= f64::EPSILON {
        return vec![0.0; values.len()];
    }
    values.iter().map(|v| (v - m) / s).collect()
}

/// Average path length of an unsuccessful BST search, `c(n)`.
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

enum IsolationNode {
    Leaf { size: usize },
    Split { threshold: f64, left: Box<IsolationNode>, right: Box<IsolationNode> },
}

fn build_tree(sample: &mut [f64], depth: usize, max_depth: usize, rng: &mut StdRng) -> IsolationNode {
    if sample.len() <= 1 || depth >= max_depth {
        return IsolationNode::Leaf { size: sample.len() };
    }
    let (min, max) = sample
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    let span = max - min;
    if span <= f64::EPSILON || !span.is_finite() {
        return IsolationNode::Leaf { size: sample.len() };
    }
    let threshold = rng.gen_range(min..max);
    let mut split = 0;
    for i in 0..sample.len() {
        if sample[i] < threshold {
            sample.swap(i, split);
            split += 1;
        }
    }
    let (left, right) = sample.split_at_mut(split);
    IsolationNode::Split {
        threshold,
        left: Box::new(build_tree(left, depth + 1, max_depth, rng)),
        right: Box::new(build_tree(right, depth + 1, max_depth, rng)),
    }
}

fn path_length(node: &IsolationNode, value: f64, depth: f64) -> f64 {
    match node {
        IsolationNode::Leaf { size } => depth + average_path_length(*size),
        IsolationNode::Split { threshold, left, right } => {
            if value < *threshold {
                path_length(left, value, depth + 1.0)
            } else {
                path_length(right, value, depth + 1.0)
            }
        }
    }
}

/// Isolation forest anomaly scores in (0, 1]; higher is more anomalous.
/// Seeded so repeated analyses of the same data agree.
pub fn isolation_scores(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    if n < 3 {
        return vec![0.0; n];
    }
    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    if !(max - min).is_finite() {
        tracing::debug!("Value range overflows, skipping isolation scoring");
        return vec![0.0; n];
    }
    let mut rng = StdRng::seed_from_u64(ISOLATION_SEED);
    let sample_size = n.min(ISOLATION_SAMPLE);
    let max_depth = (sample_size as f64).log2().ceil() as usize;

    let trees: Vec<IsolationNode> = (0..ISOLATION_TREES)
        .map(|_| {
            let mut sample: Vec<f64> = if sample_size == n {
                values.to_vec()
            } else {
                rand::seq::index::sample(&mut rng, n, sample_size)
                    .into_iter()
                    .map(|i| values[i])
                    .collect()
            };
            build_tree(&mut sample, 0, max_depth, &mut rng)
        })
        .collect();

    let normalizer = average_path_length(sample_size);
    values
        .iter()
        .map(|v| {
            let avg = trees.iter().map(|t| path_length(t, *v, 0.0)).sum::<f64>() / trees.len() as f64;
            2f64.powf(-avg / normalizer)
        })
        .collect()
}

/// One-dimensional LOF using the sorted order for neighbour search.
pub fn lof_scores(values: &[f64], k: usize) -> Vec<f64> {
    let n = values.len();
    if n <= k {
        return vec![1.0; n];
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|a, b| values[*a].total_cmp(&values[*b]));
    let sorted: Vec<f64> = order.iter().map(|i| values[*i]).collect();

    // neighbours[p] are positions in sorted order of the k nearest points
    let neighbours: Vec<Vec<usize>> = (0..n)
        .map(|p| {
            let (mut lo, mut hi) = (p, p);
            let mut found = Vec::with_capacity(k);
            while found.len() < k {
                let left = (lo > 0).then(|| sorted[p] - sorted[lo - 1]);
                let right = (hi + 1 < n).then(|| sorted[hi + 1] - sorted[p]);
                match (left, right) {
                    (Some(l), Some(r)) if l <= r => {
                        lo -= 1;
                        found.push(lo);
                    }
                    (Some(_), None) => {
                        lo -= 1;
                        found.push(lo);
                    }
                    (_, Some(_)) => {
                        hi += 1;
                        found.push(hi);
                    }
                    (None, None) => break,
                }
            }
            found
        })
        .collect();

    let k_distance: Vec<f64> = (0..n)
        .map(|p| {
            neighbours[p]
                .iter()
                .map(|q| (sorted[p] - sorted[*q]).abs())
                .fold(0.0, f64::max)
        })
        .collect();

    let lrd: Vec<f64> = (0..n)
        .map(|p| {
            let reach: f64 = neighbours[p]
                .iter()
                .map(|q| k_distance[*q].max((sorted[p] - sorted[*q]).abs()))
                .sum::<f64>()
                / neighbours[p].len() as f64;
            1.0 / (reach + 1e-10)
        })
        .collect();

    let mut scores = vec![1.0; n];
    for p in 0..n {
        let neighbour_lrd: f64 =
            neighbours[p].iter().map(|q| lrd[*q]).sum::<f64>() / neighbours[p].len() as f64;
        scores[order[p]] = neighbour_lrd / lrd[p];
    }
    scores
}

pub fn detect(values: &[f64]) -> OutlierReport {
    if values.len() < 4 {
        return OutlierReport {
            iqr: vec![false; values.len()],
            z_score: vec![false; values.len()],
            isolation: vec![false; values.len()],
            lof: vec![false; values.len()],
            anomalies: Vec::new(),
        };
    }

    let z = z_scores(values);
    let iqr = iqr_flags(values);
    let z_flags: Vec<bool> = z.iter().map(|s| s.abs() > Z_THRESHOLD).collect();
    let isolation: Vec<bool> = isolation_scores(values)
        .into_iter()
        .map(|s| s > ISOLATION_THRESHOLD)
        .collect();
    let lof: Vec<bool> = lof_scores(values, LOF_NEIGHBORS)
        .into_iter()
        .map(|s| s > LOF_THRESHOLD)
        .collect();

    let anomalies = (0..values.len())
        .filter_map(|i| {
            let mut methods = SmallVec::<[OutlierMethod; 4]>::new();
            if iqr[i] {
                methods.push(OutlierMethod::Iqr);
            }
            if z_flags[i] {
                methods.push(OutlierMethod::ZScore);
            }
            if isolation[i] {
                methods.push(OutlierMethod::IsolationForest);
            }
            if lof[i] {
                methods.push(OutlierMethod::Lof);
            }
            (methods.len() >= ENSEMBLE_VOTES).then(|| AnomalyRecord {
                index: i,
                value: values[i],
                methods,
                severity: Severity::from_z(z[i]),
                z_score: z[i],
            })
        })
        .collect();

    OutlierReport { iqr, z_score: z_flags, isolation, lof, anomalies }
}
