use std::collections::{BTreeMap, HashMap};

use rayon::prelude::*;
use serde::Serialize;

use super::descriptive::{chi_square_survival, mean, population_std_dev, ranks};

/// Kendall is O(n^2); larger inputs are thinned to this many pairs.
const KENDALL_MAX_SAMPLE: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationMethod {
    Pearson,
    Spearman,
    Kendall,
    CramersV,
    PointBiserial,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationEdge {
    pub source: String,
    pub target: String,
    pub method: CorrelationMethod,
    pub coefficient: f64,
    pub strength: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p_value: Option<f64>,
    pub sample_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkNode {
    pub name: String,
    pub degree: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationNetwork {
    pub nodes: Vec<NetworkNode>,
    pub edges: Vec<CorrelationEdge>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationReport {
    pub threshold: f64,
    /// Every numeric pair, regardless of threshold.
    pub numeric_pairs: Vec<PairCorrelation>,
    pub categorical_pairs: Vec<CorrelationEdge>,
    pub mixed_pairs: Vec<CorrelationEdge>,
    pub network: CorrelationNetwork,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairCorrelation {
    pub source: String,
    pub target: String,
    pub pearson: f64,
    pub spearman: f64,
    pub kendall: f64,
    pub sample_size: usize,
}

/// A column fed into the correlation suite. `None` marks a missing cell.
pub struct NumericSeries<'a> {
    pub name: &'a str,
    pub values: &'a [Option<f64>],
}

pub struct CategoricalSeries<'a> {
    pub name: &'a str,
    pub values: &'a [Option<String>],
}

pub fn strength_label(r: f64) -> String {
    let r = r.abs();
    match () {
        _ if r >= 0.9 => "very strong",
        _ if r >= 0.7 => "strong",
        _ if r >= 0.5 => "moderate",
        _ if r >= 0.3 => "weak",
        _ => "negligible",
    }
    .to_string()
}

pub fn pearson(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len().min(y.len());
    if n < 2 {
        return 0.0;
    }
    let (mx, my) = (mean(&x[..n]), mean(&y[..n]));
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for i in 0..n {
        let (dx, dy) = (x[i] - mx, y[i] - my);
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx <= 0.0 || syy <= 0.0 {
        return 0.0;
    }
    (sxy / (sxx.sqrt() * syy.sqrt())).clamp(-1.0, 1.0)
}

/// Pearson on average ranks.
pub fn spearman(x: &[f64], y: &[f64]) -> f64 {
    pearson(&ranks(x), &ranks(y))
}

/// Kendall tau-b, tie corrected.
pub fn kendall(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len().min(y.len());
    if n < 2 {
        return 0.0;
    }
    let step = (n / KENDALL_MAX_SAMPLE).max(1);
    let idx: Vec<usize> = (0..n).step_by(step).collect();
    let (mut concordant, mut discordant, mut ties_x, mut ties_y) = (0i64, 0i64, 0i64, 0i64);
    for a in 0..idx.len() {
        for b in (a + 1)..idx.len() {
            let dx = x[idx[a]] - x[idx[b]];
            let dy = y[idx[a]] - y[idx[b]];
            if dx == 0.0 && dy == 0.0 {
                continue;
            } else if dx == 0.0 {
                ties_x += 1;
            } else if dy == 0.0 {
                ties_y += 1;
            } else if (dx > 0.0) == (dy > 0.0) {
                concordant += 1;
            } else {
                discordant += 1;
            }
        }
    }
    let denom = (((concordant + discordant + ties_x) as f64) * ((concordant + discordant + ties_y) as f64)).sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    (concordant - discordant) as f64 / denom
}

/// Pairwise-complete observations of two aligned columns.
pub fn complete_pairs(x: &[Option<f64>], y: &[Option<f64>]) -> (Vec<f64>, Vec<f64>) {
    x.iter()
        .zip(y.iter())
        .filter_map(|(a, b)| Some(((*a)?, (*b)?)))
        .unzip()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChiSquare {
    pub statistic: f64,
    pub degrees_of_freedom: usize,
    pub p_value: f64,
    pub cramers_v: f64,
    pub n: usize,
}

/// Chi-square test of independence on the contingency table of two
/// categorical columns, with Cramér's V as effect size.
pub fn chi_square(x: &[Option<String>], y: &[Option<String>]) -> Option<ChiSquare> {
    let mut table: HashMap<(&str, &str), usize> = HashMap::new();
    let mut row_totals: BTreeMap<&str, usize> = BTreeMap::new();
    let mut col_totals: BTreeMap<&str, usize> = BTreeMap::new();
    let mut n = 0usize;
    for (a, b) in x.iter().zip(y.iter()) {
        if let (Some(a), Some(b)) = (a, b) {
            *table.entry((a.as_str(), b.as_str())).or_default() += 1;
            *row_totals.entry(a.as_str()).or_default() += 1;
            *col_totals.entry(b.as_str()).or_default() += 1;
            n += 1;
        }
    }
    let (r, c) = (row_totals.len(), col_totals.len());
    if n == 0 || r < 2 || c < 2 {
        return None;
    }
    let nf = n as f64;
    let mut statistic = 0.0;
    for (row, rt) in &row_totals {
        for (col, ct) in &col_totals {
            let expected = (*rt as f64) * (*ct as f64) / nf;
            let observed = table.get(&(*row, *col)).copied().unwrap_or(0) as f64;
            statistic += (observed - expected).powi(2) / expected;
        }
    }
    let dof = (r - 1) * (c - 1);
    let cramers_v = (statistic / (nf * (r.min(c) - 1) as f64)).sqrt().min(1.0);
    Some(ChiSquare {
        statistic,
        degrees_of_freedom: dof,
        p_value: chi_square_survival(statistic, dof as f64),
        cramers_v,
        n,
    })
}

/// Point-biserial correlation of a numeric column against a two-valued
/// categorical column. `None` unless the categorical side is binary.
pub fn point_biserial(values: &[Option<f64>], groups: &[Option<String>]) -> Option<(f64, usize)> {
    let pairs: Vec<(f64, &str)> = values
        .iter()
        .zip(groups.iter())
        .filter_map(|(v, g)| Some(((*v)?, g.as_deref()?)))
        .collect();
    let mut labels: Vec<&str> = pairs.iter().map(|(_, g)| *g).collect();
    labels.sort_unstable();
    labels.dedup();
    if labels.len() != 2 || pairs.len() < 3 {
        return None;
    }
    let all: Vec<f64> = pairs.iter().map(|(v, _)| *v).collect();
    let s = population_std_dev(&all);
    if s <= f64::EPSILON {
        return None;
    }
    let group1: Vec<f64> = pairs.iter().filter(|(_, g)| *g == labels[1]).map(|(v, _)| *v).collect();
    let group0: Vec<f64> = pairs.iter().filter(|(_, g)| *g == labels[0]).map(|(v, _)| *v).collect();
    let p = group1.len() as f64 / all.len() as f64;
    let r = (mean(&group1) - mean(&group0)) / s * (p * (1.0 - p)).sqrt();
    Some((r.clamp(-1.0, 1.0), all.len()))
}

fn build_network(edges: Vec<CorrelationEdge>) -> CorrelationNetwork {
    let mut degree: BTreeMap<String, usize> = BTreeMap::new();
    for edge in &edges {
        *degree.entry(edge.source.clone()).or_default() += 1;
        *degree.entry(edge.target.clone()).or_default() += 1;
    }
    CorrelationNetwork {
        nodes: degree.into_iter().map(|(name, degree)| NetworkNode { name, degree }).collect(),
        edges,
    }
}

pub fn analyze(
    numeric: &[NumericSeries<'_>],
    categorical: &[CategoricalSeries<'_>],
    threshold: f64,
) -> CorrelationReport {
    let index_pairs: Vec<(usize, usize)> = (0..numeric.len())
        .flat_map(|i| ((i + 1)..numeric.len()).map(move |j| (i, j)))
        .collect();

    let numeric_pairs: Vec<PairCorrelation> = index_pairs
        .par_iter()
        .filter_map(|(i, j)| {
            let (x, y) = complete_pairs(numeric[*i].values, numeric[*j].values);
            (x.len() >= 3).then(|| PairCorrelation {
                source: numeric[*i].name.to_string(),
                target: numeric[*j].name.to_string(),
                pearson: pearson(&x, &y),
                spearman: spearman(&x, &y),
                kendall: kendall(&x, &y),
                sample_size: x.len(),
            })
        })
        .collect();

    let mut edges = Vec::new();
    for pair in &numeric_pairs {
        for (method, coefficient) in [
            (CorrelationMethod::Pearson, pair.pearson),
            (CorrelationMethod::Spearman, pair.spearman),
        ] {
            if coefficient.abs() >= threshold {
                edges.push(CorrelationEdge {
                    source: pair.source.clone(),
                    target: pair.target.clone(),
                    method,
                    coefficient,
                    strength: strength_label(coefficient),
                    p_value: None,
                    sample_size: pair.sample_size,
                });
            }
        }
    }

    let mut categorical_pairs = Vec::new();
    for i in 0..categorical.len() {
        for j in (i + 1)..categorical.len() {
            if let Some(test) = chi_square(categorical[i].values, categorical[j].values) {
                categorical_pairs.push(CorrelationEdge {
                    source: categorical[i].name.to_string(),
                    target: categorical[j].name.to_string(),
                    method: CorrelationMethod::CramersV,
                    coefficient: test.cramers_v,
                    strength: strength_label(test.cramers_v),
                    p_value: Some(test.p_value),
                    sample_size: test.n,
                });
            }
        }
    }

    let mut mixed_pairs = Vec::new();
    for num in numeric {
        for cat in categorical {
            if let Some((r, n)) = point_biserial(num.values, cat.values) {
                mixed_pairs.push(CorrelationEdge {
                    source: num.name.to_string(),
                    target: cat.name.to_string(),
                    method: CorrelationMethod::PointBiserial,
                    coefficient: r,
                    strength: strength_label(r),
                    p_value: None,
                    sample_size: n,
                });
            }
        }
    }

    edges.extend(
        categorical_pairs
            .iter()
            .chain(mixed_pairs.iter())
            .filter(|e| e.coefficient.abs() >= threshold)
            .cloned(),
    );

    CorrelationReport {
        threshold,
        numeric_pairs,
        categorical_pairs,
        mixed_pairs,
        network: build_network(edges),
    }
}
