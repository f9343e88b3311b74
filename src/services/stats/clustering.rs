//! K-means++ with silhouette-based k selection, DBSCAN with an estimated
//! radius, and agglomerative clustering.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use super::descriptive::{quantile, sorted_copy};
use crate::config::Linkage;

const KMEANS_SEED: u64 = 0x6b6d_6561;
const KMEANS_RESTARTS: usize = 3;
const MAX_ITERATIONS: usize = 100;
/// Pairwise algorithms run on at most this many evenly strided points.
pub const PAIRWISE_LIMIT: usize = 1_000;
pub const HIERARCHICAL_LIMIT: usize = 300;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResult {
    pub label: usize,
    pub size: usize,
    pub centroid: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KMeansSummary {
    pub optimal_k: usize,
    pub silhouette: f64,
    /// Silhouette per candidate k, in ascending k.
    pub scores: Vec<(usize, f64)>,
    pub inertia: f64,
    pub clusters: Vec<ClusterResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbscanSummary {
    pub eps: f64,
    pub min_pts: usize,
    pub cluster_count: usize,
    pub noise_points: usize,
    pub cluster_sizes: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchicalSummary {
    pub linkage: Linkage,
    pub cluster_count: usize,
    pub cluster_sizes: Vec<usize>,
    /// Distance at which each merge happened, in merge order.
    pub merge_heights: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusteringReport {
    pub features: Vec<String>,
    pub points: usize,
    pub kmeans: KMeansSummary,
    pub dbscan: DbscanSummary,
    pub hierarchical: HierarchicalSummary,
}

#[derive(Debug, Clone)]
pub struct KMeansFit {
    pub labels: Vec<usize>,
    pub centroids: Vec<Vec<f64>>,
    pub inertia: f64,
}

pub fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

pub fn distance(a: &[f64], b: &[f64]) -> f64 {
    squared_distance(a, b).sqrt()
}

/// Evenly strided subset so pairwise work stays bounded.
pub fn thin(points: &[Vec<f64>], limit: usize) -> Vec<Vec<f64>> {
    if points.len() <= limit {
        return points.to_vec();
    }
    let step = points.len() as f64 / limit as f64;
    (0..limit).map(|i| points[(i as f64 * step) as usize].clone()).collect()
}

fn nearest(point: &[f64], centroids: &[Vec<f64>]) -> (usize, f64) {
    centroids
        .iter()
        .enumerate()
        .map(|(i, c)| (i, squared_distance(point, c)))
        .fold((0, f64::INFINITY), |best, cur| if cur.1 < best.1 { cur } else { best })
}

fn plus_plus_init(points: &[Vec<f64>], k: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    let mut centroids = vec![points[rng.gen_range(0..points.len())].clone()];
    while centroids.len() < k {
        let weights: Vec<f64> = points.iter().map(|p| nearest(p, &centroids).1).collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            // every point already coincides with a centroid
            centroids.push(points[rng.gen_range(0..points.len())].clone());
            continue;
        }
        let mut target = rng.gen_range(0.0..total);
        let mut chosen = points.len() - 1;
        for (i, w) in weights.iter().enumerate() {
            if target < *w {
                chosen = i;
                break;
            }
            target -= w;
        }
        centroids.push(points[chosen].clone());
    }
    centroids
}

fn lloyd(points: &[Vec<f64>], mut centroids: Vec<Vec<f64>>) -> KMeansFit {
    let dims = points[0].len();
    let mut labels = vec![usize::MAX; points.len()];
    for _ in 0..MAX_ITERATIONS {
        let mut changed = false;
        for (i, p) in points.iter().enumerate() {
            let (label, _) = nearest(p, &centroids);
            if labels[i] != label {
                labels[i] = label;
                changed = true;
            }
        }
        if !changed {
            break;
        }
        let mut sums = vec![vec![0.0; dims]; centroids.len()];
        let mut counts = vec![0usize; centroids.len()];
        for (p, label) in points.iter().zip(&labels) {
            counts[*label] += 1;
            for (s, v) in sums[*label].iter_mut().zip(p) {
                *s += v;
            }
        }
        for (c, (sum, count)) in centroids.iter_mut().zip(sums.into_iter().zip(counts)) {
            // empty clusters keep their previous centroid
            if count > 0 {
                *c = sum.into_iter().map(|s| s / count as f64).collect();
            }
        }
    }
    let inertia = points
        .iter()
        .zip(&labels)
        .map(|(p, l)| squared_distance(p, &centroids[*l]))
        .sum();
    KMeansFit { labels, centroids, inertia }
}

/// Best of a few seeded k-means++ restarts by inertia.
pub fn kmeans(points: &[Vec<f64>], k: usize) -> Option<KMeansFit> {
    if points.is_empty() || k == 0 || k > points.len() {
        return None;
    }
    let mut rng = StdRng::seed_from_u64(KMEANS_SEED ^ k as u64);
    (0..KMEANS_RESTARTS)
        .map(|_| lloyd(points, plus_plus_init(points, k, &mut rng)))
        .min_by(|a, b| a.inertia.total_cmp(&b.inertia))
}

/// Mean silhouette coefficient. Singleton clusters contribute 0.
pub fn silhouette(points: &[Vec<f64>], labels: &[usize], k: usize) -> f64 {
    let n = points.len();
    if n < 2 || k < 2 {
        return 0.0;
    }
    let mut total = 0.0;
    for i in 0..n {
        let mut sums = vec![0.0; k];
        let mut counts = vec![0usize; k];
        for j in 0..n {
            if i != j {
                sums[labels[j]] += distance(&points[i], &points[j]);
                counts[labels[j]] += 1;
            }
        }
        let own = labels[i];
        if counts[own] == 0 {
            continue;
        }
        let a = sums[own] / counts[own] as f64;
        let b = (0..k)
            .filter(|c| *c != own && counts[*c] > 0)
            .map(|c| sums[c] / counts[c] as f64)
            .fold(f64::INFINITY, f64::min);
        if b.is_finite() {
            let denom = a.max(b);
            if denom > 0.0 {
                total += (b - a) / denom;
            }
        }
    }
    total / n as f64
}

/// Runs k-means for k in `2..=max_k` and keeps the highest silhouette. Ties
/// keep the smaller k.
pub fn optimal_k(points: &[Vec<f64>], max_k: usize) -> Option<(KMeansFit, Vec<(usize, f64)>)> {
    let upper = max_k.min(points.len().saturating_sub(1));
    let mut best: Option<(KMeansFit, f64)> = None;
    let mut scores = Vec::new();
    for k in 2..=upper {
        let Some(fit) = kmeans(points, k) else { continue };
        let score = silhouette(points, &fit.labels, k);
        scores.push((k, score));
        if best.as_ref().map_or(true, |(_, s)| score > *s) {
            best = Some((fit, score));
        }
    }
    best.map(|(fit, _)| (fit, scores))
}

/// Radius from the 95th percentile of each point's distance to its
/// `min_pts`-th nearest neighbour.
pub fn estimate_eps(points: &[Vec<f64>], min_pts: usize) -> f64 {
    let n = points.len();
    if n < 2 {
        return 0.0;
    }
    let k = min_pts.clamp(1, n - 1);
    let k_distances: Vec<f64> = points
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let mut dists: Vec<f64> = points
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, q)| distance(p, q))
                .collect();
            dists.sort_by(f64::total_cmp);
            dists[k - 1]
        })
        .collect();
    quantile(&sorted_copy(&k_distances), 0.95)
}

/// DBSCAN labels; `None` is noise.
pub fn dbscan(points: &[Vec<f64>], eps: f64, min_pts: usize) -> Vec<Option<usize>> {
    let n = points.len();
    let neighbours = |i: usize| -> Vec<usize> {
        (0..n).filter(|j| distance(&points[i], &points[*j]) <= eps).collect()
    };
    let mut labels: Vec<Option<usize>> = vec![None; n];
    let mut visited = vec![false; n];
    let mut cluster = 0;
    for i in 0..n {
        if visited[i] {
            continue;
        }
        visited[i] = true;
        let seeds = neighbours(i);
        if seeds.len() < min_pts {
            continue;
        }
        labels[i] = Some(cluster);
        let mut queue = seeds;
        while let Some(j) = queue.pop() {
            if labels[j].is_none() {
                labels[j] = Some(cluster);
            }
            if visited[j] {
                continue;
            }
            visited[j] = true;
            let reach = neighbours(j);
            if reach.len() >= min_pts {
                queue.extend(reach.into_iter().filter(|q| !visited[*q] || labels[*q].is_none()));
            }
        }
        cluster += 1;
    }
    labels
}

/// Agglomerative clustering with Lance-Williams distance updates. Returns
/// flat labels once `target` clusters remain, plus every merge height.
pub fn hierarchical(points: &[Vec<f64>], target: usize, linkage: Linkage) -> (Vec<usize>, Vec<f64>) {
    let n = points.len();
    if n == 0 {
        return (Vec::new(), Vec::new());
    }
    let mut dist = vec![0.0; n * n];
    for i in 0..n {
        for j in (i + 1)..n {
            let d = distance(&points[i], &points[j]);
            dist[i * n + j] = d;
            dist[j * n + i] = d;
        }
    }
    let mut members: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
    let mut active: Vec<usize> = (0..n).collect();
    let mut heights = Vec::new();

    while active.len() > target.max(1) {
        let mut best = (0, 1, f64::INFINITY);
        for (ai, &a) in active.iter().enumerate() {
            for &b in &active[ai + 1..] {
                let d = dist[a * n + b];
                if d < best.2 {
                    best = (a, b, d);
                }
            }
        }
        let (a, b, height) = best;
        let (size_a, size_b) = (members[a].len() as f64, members[b].len() as f64);
        for &k in active.iter().filter(|k| **k != a && **k != b) {
            let (da, db) = (dist[k * n + a], dist[k * n + b]);
            let merged = match linkage {
                Linkage::Single => da.min(db),
                Linkage::Complete => da.max(db),
                Linkage::Average => (size_a * da + size_b * db) / (size_a + size_b),
            };
            dist[k * n + a] = merged;
            dist[a * n + k] = merged;
        }
        let absorbed = std::mem::take(&mut members[b]);
        members[a].extend(absorbed);
        active.retain(|k| *k != b);
        heights.push(height);
    }

    let mut labels = vec![0; n];
    for (label, &cluster) in active.iter().enumerate() {
        for &point in &members[cluster] {
            labels[point] = label;
        }
    }
    (labels, heights)
}

fn sizes(labels: impl Iterator<Item = usize>, k: usize) -> Vec<usize> {
    let mut counts = vec![0; k];
    for l in labels {
        counts[l] += 1;
    }
    counts
}

/// Full clustering suite over standardized feature rows.
pub fn analyze(
    features: Vec<String>,
    rows: &[Vec<f64>],
    max_clusters: usize,
    min_pts: usize,
    linkage: Linkage,
) -> Option<ClusteringReport> {
    if rows.len() < 4 || features.is_empty() {
        return None;
    }
    let points = thin(rows, PAIRWISE_LIMIT);
    let (fit, scores) = optimal_k(&points, max_clusters)?;
    let k = fit.centroids.len();
    let kmeans_sizes = sizes(fit.labels.iter().copied(), k);
    let best_score = scores
        .iter()
        .find(|(candidate, _)| *candidate == k)
        .map_or(0.0, |(_, s)| *s);

    let eps = estimate_eps(&points, min_pts);
    let db_labels = dbscan(&points, eps, min_pts);
    let cluster_count = db_labels.iter().flatten().max().map_or(0, |m| m + 1);
    let noise_points = db_labels.iter().filter(|l| l.is_none()).count();

    let sample = thin(&points, HIERARCHICAL_LIMIT);
    let (h_labels, merge_heights) = hierarchical(&sample, k, linkage);
    let h_count = h_labels.iter().max().map_or(0, |m| m + 1);

    Some(ClusteringReport {
        features,
        points: points.len(),
        kmeans: KMeansSummary {
            optimal_k: k,
            silhouette: best_score,
            scores,
            inertia: fit.inertia,
            clusters: fit
                .centroids
                .iter()
                .enumerate()
                .map(|(label, centroid)| ClusterResult {
                    label,
                    size: kmeans_sizes[label],
                    centroid: centroid.clone(),
                })
                .collect(),
        },
        dbscan: DbscanSummary {
            eps,
            min_pts,
            cluster_count,
            noise_points,
            cluster_sizes: sizes(db_labels.iter().flatten().copied(), cluster_count),
        },
        hierarchical: HierarchicalSummary {
            linkage,
            cluster_count: h_count,
            cluster_sizes: sizes(h_labels.into_iter(), h_count),
            merge_heights,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Box-Muller draws around `center`.
    fn blob(rng: &mut StdRng, center: (f64, f64), n: usize) -> Vec<Vec<f64>> {
        (0..n)
            .map(|_| {
                let (u1, u2): (f64, f64) = (rng.gen_range(1e-9..1.0), rng.gen_range(0.0..1.0));
                let r = (-2.0 * u1.ln()).sqrt();
                let theta = 2.0 * std::f64::consts::PI * u2;
                vec![center.0 + r * theta.cos(), center.1 + r * theta.sin()]
            })
            .collect()
    }

    fn two_blobs() -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(7);
        let mut points = blob(&mut rng, (0.0, 0.0), 60);
        points.extend(blob(&mut rng, (12.0, 12.0), 60));
        points
    }

    #[test]
    fn two_blobs_pick_k_two() {
        let points = two_blobs();
        let (fit, scores) = optimal_k(&points, 6).unwrap();
        assert_eq!(fit.centroids.len(), 2);
        let k2 = scores.iter().find(|(k, _)| *k == 2).unwrap().1;
        assert!(k2 > 0.5, "silhouette {}", k2);
        assert!(fit.labels[..60].iter().all(|l| *l == fit.labels[0]));
        assert!(fit.labels[60..].iter().all(|l| *l != fit.labels[0]));
    }

    #[test]
    fn dbscan_separates_blobs_and_marks_noise() {
        let mut points = two_blobs();
        points.push(vec![100.0, -100.0]);
        let eps = estimate_eps(&points, 5);
        assert!(eps > 0.0);
        let labels = dbscan(&points, eps, 5);
        assert_eq!(labels[120], None);
        let clusters = labels.iter().flatten().max().unwrap() + 1;
        assert_eq!(clusters, 2);
    }

    #[test]
    fn linkages_all_recover_two_groups() {
        let points = thin(&two_blobs(), 80);
        for linkage in [Linkage::Single, Linkage::Complete, Linkage::Average] {
            let (labels, heights) = hierarchical(&points, 2, linkage);
            assert_eq!(heights.len(), points.len() - 2);
            let first = labels[0];
            let same = labels.iter().filter(|l| **l == first).count();
            assert_eq!(same, 40, "{:?}", linkage);
        }
    }

    #[test]
    fn silhouette_prefers_smaller_k_on_ties() {
        // four identical points: every k scores 0
        let points = vec![vec![1.0, 1.0]; 4];
        let (fit, scores) = optimal_k(&points, 3).unwrap();
        assert!(scores.iter().all(|(_, s)| *s == 0.0));
        assert_eq!(fit.centroids.len(), 2);
    }

    #[test]
    fn report_covers_all_algorithms() {
        let report = analyze(
            vec!["x".into(), "y".into()],
            &two_blobs(),
            5,
            5,
            Linkage::Average,
        )
        .unwrap();
        assert_eq!(report.kmeans.optimal_k, 2);
        assert_eq!(report.kmeans.clusters.iter().map(|c| c.size).sum::<usize>(), 120);
        assert_eq!(report.hierarchical.cluster_count, 2);
        assert!(analyze(vec!["x".into()], &[vec![1.0]], 5, 5, Linkage::Single).is_none());
    }
}
