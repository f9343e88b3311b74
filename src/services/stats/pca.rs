use serde::Serialize;

use super::descriptive::standardize;

const MAX_COMPONENTS: usize = 10;
const POWER_ITERATIONS: usize = 500;
const CONVERGENCE: f64 = 1e-10;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrincipalComponent {
    pub eigenvalue: f64,
    pub explained_variance_ratio: f64,
    pub cumulative_variance_ratio: f64,
    /// Feature weights, in the order of `PcaResult::features`.
    pub loadings: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PcaResult {
    pub features: Vec<String>,
    pub samples: usize,
    pub components: Vec<PrincipalComponent>,
    /// Fewest components whose cumulative explained variance reaches 90%.
    pub components_for_90: usize,
    pub components_for_95: usize,
}

/// Covariance of already standardized columns.
pub fn covariance_matrix(columns: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let p = columns.len();
    let n = columns.first().map_or(0, Vec::len);
    let mut cov = vec![vec![0.0; p]; p];
    if n < 2 {
        return cov;
    }
    for i in 0..p {
        for j in i..p {
            let c = columns[i].iter().zip(&columns[j]).map(|(a, b)| a * b).sum::<f64>() / (n - 1) as f64;
            cov[i][j] = c;
            cov[j][i] = c;
        }
    }
    cov
}

fn mat_vec(m: &[Vec<f64>], v: &[f64]) -> Vec<f64> {
    m.iter().map(|row| row.iter().zip(v).map(|(a, b)| a * b).sum()).collect()
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Dominant eigenpair by power iteration.
pub fn power_iteration(m: &[Vec<f64>]) -> Option<(f64, Vec<f64>)> {
    let p = m.len();
    // slightly uneven start so it is never orthogonal to the answer by symmetry
    let mut v: Vec<f64> = (0..p).map(|i| 1.0 + i as f64 * 0.01).collect();
    let n0 = norm(&v);
    v.iter_mut().for_each(|x| *x /= n0);

    for _ in 0..POWER_ITERATIONS {
        let next = mat_vec(m, &v);
        let len = norm(&next);
        if len <= CONVERGENCE {
            return None;
        }
        let next: Vec<f64> = next.into_iter().map(|x| x / len).collect();
        let delta: f64 = next.iter().zip(&v).map(|(a, b)| (a - b).abs()).sum();
        v = next;
        if delta < CONVERGENCE {
            break;
        }
    }
    let eigenvalue: f64 = v.iter().zip(mat_vec(m, &v)).map(|(a, b)| a * b).sum();
    Some((eigenvalue, v))
}

/// Principal components over the given columns (equal length, no gaps).
pub fn analyze(features: Vec<String>, columns: &[Vec<f64>]) -> Option<PcaResult> {
    let samples = columns.first().map_or(0, Vec::len);
    if columns.len() < 2 || samples < 3 {
        return None;
    }
    let standardized: Vec<Vec<f64>> = columns.iter().map(|c| standardize(c)).collect();
    let mut matrix = covariance_matrix(&standardized);
    let total_variance: f64 = (0..matrix.len()).map(|i| matrix[i][i]).sum();
    if total_variance <= 0.0 {
        return None;
    }

    let mut components = Vec::new();
    let mut cumulative = 0.0;
    for _ in 0..columns.len().min(MAX_COMPONENTS) {
        let Some((eigenvalue, vector)) = power_iteration(&matrix) else { break };
        let eigenvalue = eigenvalue.max(0.0);
        // deflate
        for i in 0..matrix.len() {
            for j in 0..matrix.len() {
                matrix[i][j] -= eigenvalue * vector[i] * vector[j];
            }
        }
        let ratio = eigenvalue / total_variance;
        cumulative += ratio;
        components.push(PrincipalComponent {
            eigenvalue,
            explained_variance_ratio: ratio,
            cumulative_variance_ratio: cumulative.min(1.0),
            loadings: vector,
        });
    }

    let reach = |level: f64| {
        components
            .iter()
            .position(|c| c.cumulative_variance_ratio >= level - 1e-9)
            .map_or(components.len(), |i| i + 1)
    };
    let components_for_90 = reach(0.90);
    let components_for_95 = reach(0.95);

    Some(PcaResult { features, samples, components, components_for_90, components_for_95 })
}
