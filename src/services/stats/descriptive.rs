//! Descriptive statistics and the numeric primitives the rest of the
//! statistics engine builds on.

use serde::Serialize;

use crate::services::excel::types::HistogramBin;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NumericSummary {
    pub count: usize,
    pub sum: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
    pub variance: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    pub iqr: f64,
}

/// Shape statistics that only make sense with a reasonable sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvancedColumnStats {
    pub skewness: f64,
    /// Excess kurtosis (0 for a normal distribution).
    pub kurtosis: f64,
    pub jarque_bera: f64,
    pub jarque_bera_p_value: f64,
    pub is_normal: bool,
    pub coefficient_of_variation: Option<f64>,
    pub median_absolute_deviation: f64,
}

pub const MIN_ADVANCED_SAMPLE: usize = 8;

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample variance (n - 1 denominator).
pub fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64
}

pub fn std_dev(values: &[f64]) -> f64 {
    variance(values).sqrt()
}

/// Population standard deviation (n denominator).
pub fn population_std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

pub fn sorted_copy(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted
}

/// Linear-interpolated quantile of already sorted data.
pub fn quantile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lower = pos.floor() as usize;
            let upper = pos.ceil() as usize;
            let weight = pos - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * weight
        }
    }
}

pub fn summarize(values: &[f64]) -> Option<NumericSummary> {
    if values.is_empty() {
        return None;
    }
    let sorted = sorted_copy(values);
    let sum: f64 = values.iter().sum();
    let variance = variance(values);
    let q1 = quantile(&sorted, 0.25);
    let q3 = quantile(&sorted, 0.75);
    Some(NumericSummary {
        count: values.len(),
        sum,
        mean: sum / values.len() as f64,
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        std_dev: variance.sqrt(),
        variance,
        q1,
        median: quantile(&sorted, 0.5),
        q3,
        iqr: q3 - q1,
    })
}

/// Equal-width histogram over `[min, max]`. A constant column gets one bin.
pub fn histogram(values: &[f64], bins: usize) -> (f64, Vec<HistogramBin>) {
    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    if values.is_empty() || bins == 0 {
        return (0.0, Vec::new());
    }
    if max <= min {
        return (0.0, vec![HistogramBin { start: min, end: max, count: values.len() }]);
    }
    let width = (max - min) / bins as f64;
    let mut counts = vec![0usize; bins];
    for v in values {
        let idx = (((v - min) / width) as usize).min(bins - 1);
        counts[idx] += 1;
    }
    let out = counts
        .into_iter()
        .enumerate()
        .map(|(i, count)| HistogramBin {
            start: min + width * i as f64,
            end: if i == bins - 1 { max } else { min + width * (i + 1) as f64 },
            count,
        })
        .collect();
    (width, out)
}

pub fn advanced(values: &[f64]) -> Option<AdvancedColumnStats> {
    let n = values.len();
    if n < MIN_ADVANCED_SAMPLE {
        return None;
    }
    let m = mean(values);
    let (m2, m3, m4) = values.iter().fold((0.0, 0.0, 0.0), |(a, b, c), v| {
        let d = v - m;
        (a + d * d, b + d * d * d, c + d * d * d * d)
    });
    let nf = n as f64;
    let (m2, m3, m4) = (m2 / nf, m3 / nf, m4 / nf);

    let (skewness, kurtosis) = if m2 > 0.0 {
        (m3 / m2.powf(1.5), m4 / (m2 * m2) - 3.0)
    } else {
        (0.0, 0.0)
    };
    let jarque_bera = nf / 6.0 * (skewness.powi(2) + kurtosis.powi(2) / 4.0);
    let p_value = chi_square_survival(jarque_bera, 2.0);

    let sorted = sorted_copy(values);
    let median = quantile(&sorted, 0.5);
    let deviations = sorted_copy(&values.iter().map(|v| (v - median).abs()).collect::<Vec<_>>());

    Some(AdvancedColumnStats {
        skewness,
        kurtosis,
        jarque_bera,
        jarque_bera_p_value: p_value,
        is_normal: p_value > 0.05,
        coefficient_of_variation: (m.abs() > f64::EPSILON).then(|| std_dev(values) / m.abs()),
        median_absolute_deviation: quantile(&deviations, 0.5),
    })
}

/// Average ranks (1-based); ties share the mean of their positions.
pub fn ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|a, b| values[*a].total_cmp(&values[*b]));
    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let avg = (i + j) as f64 / 2.0 + 1.0;
        for k in i..=j {
            ranks[order[k]] = avg;
        }
        i = j + 1;
    }
    ranks
}

/// Z-scores with the sample standard deviation; a constant input maps to zeros.
pub fn standardize(values: &[f64]) -> Vec<f64> {
    let m = mean(values);
    let s = std_dev(values);
    if s <= f64::EPSILON {
        return vec![0.0; values.len()];
    }
    values.iter().map(|v| (v - m) / s).collect()
}

/// Lanczos approximation of ln Γ(x).
pub fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 6] = [
        76.180_091_729_471_46,
        -86.505_320_329_416_77,
        24.014_098_240_830_91,
        -1.231_739_572_450_155,
        0.120_865_097_386_617_9e-2,
        -0.539_523_938_495_3e-5,
    ];
    let mut y = x;
    let tmp = x + 5.5;
    let tmp = tmp - (x + 0.5) * tmp.ln();
    let mut ser = 1.000_000_000_190_015;
    for c in COEFFS {
        y += 1.0;
        ser += c / y;
    }
    -tmp + (2.506_628_274_631_000_5 * ser / x).ln()
}

/// Regularized lower incomplete gamma P(a, x).
pub fn regularized_gamma_p(a: f64, x: f64) -> f64 {
    if x <= 0.0 || a <= 0.0 {
        return 0.0;
    }
    let gln = ln_gamma(a);
    if x < a + 1.0 {
        // series expansion
        let mut ap = a;
        let mut sum = 1.0 / a;
        let mut del = sum;
        for _ in 0..500 {
            ap += 1.0;
            del *= x / ap;
            sum += del;
            if del.abs() < sum.abs() * 1e-14 {
                break;
            }
        }
        (sum * (-x + a * x.ln() - gln).exp()).clamp(0.0, 1.0)
    } else {
        // continued fraction for Q, then P = 1 - Q
        let tiny = 1e-300;
        let mut b = x + 1.0 - a;
        let mut c = 1.0 / tiny;
        let mut d = 1.0 / b;
        let mut h = d;
        for i in 1..500 {
            let an = -(i as f64) * (i as f64 - a);
            b += 2.0;
            d = an * d + b;
            if d.abs() < tiny {
                d = tiny;
            }
            c = b + an / c;
            if c.abs() < tiny {
                c = tiny;
            }
            d = 1.0 / d;
            let del = d * c;
            h *= del;
            if (del - 1.0).abs() < 1e-14 {
                break;
            }
        }
        let q = (-x + a * x.ln() - gln).exp() * h;
        (1.0 - q).clamp(0.0, 1.0)
    }
}

/// Upper tail probability of the chi-square distribution.
pub fn chi_square_survival(statistic: f64, degrees_of_freedom: f64) -> f64 {
    if statistic <= 0.0 {
        return 1.0;
    }
    1.0 - regularized_gamma_p(degrees_of_freedom / 2.0, statistic / 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn summary_of_small_series() {
        let s = summarize(&[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(s.count, 5);
        assert!(close(s.sum, 15.0, 1e-12));
        assert!(close(s.mean, 3.0, 1e-12));
        assert!(close(s.median, 3.0, 1e-12));
        assert!(close(s.q1, 2.0, 1e-12));
        assert!(close(s.q3, 4.0, 1e-12));
        assert!(close(s.iqr, 2.0, 1e-12));
        assert!(close(s.std_dev, 1.581_138_830_084_19, 1e-9));
        assert!(summarize(&[]).is_none());
    }

    #[test]
    fn histogram_has_ten_bins_covering_range() {
        let values: Vec<f64> = (0..100).map(f64::from).collect();
        let (width, bins) = histogram(&values, 10);
        assert_eq!(bins.len(), 10);
        assert!(close(width, 9.9, 1e-9));
        assert_eq!(bins.iter().map(|b| b.count).sum::<usize>(), 100);
        assert!(close(bins[9].end, 99.0, 1e-12));

        let (_, single) = histogram(&[4.0, 4.0], 10);
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].count, 2);
    }

    #[test]
    fn ranks_average_ties() {
        assert_eq!(ranks(&[10.0, 20.0, 20.0, 5.0]), vec![2.0, 3.5, 3.5, 1.0]);
    }

    #[test]
    fn chi_square_tail_matches_known_values() {
        // df = 2 has closed form exp(-x/2)
        assert!(close(chi_square_survival(3.0, 2.0), (-1.5f64).exp(), 1e-9));
        // critical value 3.841 at df = 1 gives p ~ 0.05
        assert!(close(chi_square_survival(3.841_458_820_694_124, 1.0), 0.05, 1e-6));
        assert!(close(chi_square_survival(0.0, 4.0), 1.0, 1e-12));
    }

    #[test]
    fn ln_gamma_of_integers() {
        // Γ(5) = 24
        assert!(close(ln_gamma(5.0), 24f64.ln(), 1e-9));
    }

    #[test]
    fn advanced_flags_skewed_data() {
        let mut values: Vec<f64> = (0..50).map(|i| f64::from(i % 5)).collect();
        values.extend([100.0, 120.0, 150.0]);
        let stats = advanced(&values).unwrap();
        assert!(stats.skewness > 1.0);
        assert!(!stats.is_normal);
        assert!(advanced(&[1.0, 2.0]).is_none());
    }
}
