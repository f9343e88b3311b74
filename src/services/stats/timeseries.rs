//! Time-ordered analysis of a (date, value) series: linear trend, moving
//! average decomposition, autocorrelation seasonality, CUSUM changepoints and
//! a short mean-reverting forecast.

use chrono::NaiveDateTime;
use serde::Serialize;

use super::descriptive::{mean, population_std_dev, std_dev};

pub const PERIOD: usize = 12;
pub const MIN_POINTS: usize = 6;
const SEASONALITY_MIN_ACF: f64 = 0.3;
const CUSUM_SLACK: f64 = 0.5;
const CUSUM_THRESHOLD: f64 = 3.0;
/// Per-step decay of the last difference towards the mean difference.
const REVERSION: f64 = 0.5;
const Z_95: f64 = 1.96;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendInfo {
    pub direction: TrendDirection,
    /// Change per observation.
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesDecomposition {
    pub period: usize,
    pub trend: Vec<Option<f64>>,
    pub seasonal: Vec<f64>,
    pub residual: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Seasonality {
    pub detected: bool,
    pub period: Option<usize>,
    pub strength: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Changepoint {
    pub index: usize,
    pub date: String,
    pub direction: TrendDirection,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastPoint {
    pub step: usize,
    pub value: f64,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Forecast {
    pub method: String,
    pub horizon: usize,
    pub points: Vec<ForecastPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesAnalysis {
    pub date_column: String,
    pub value_column: String,
    pub points: usize,
    pub start: String,
    pub end: String,
    pub trend: TrendInfo,
    pub decomposition: Option<TimeSeriesDecomposition>,
    pub seasonality: Seasonality,
    pub changepoints: Vec<Changepoint>,
    pub forecast: Forecast,
}

/// Least squares fit of value against observation index.
pub fn linear_trend(values: &[f64]) -> TrendInfo {
    let n = values.len() as f64;
    let x_mean = (n - 1.0) / 2.0;
    let y_mean = mean(values);
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - x_mean;
        let dy = y - y_mean;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
    let r_squared = if sxx > 0.0 && syy > 0.0 { (sxy * sxy) / (sxx * syy) } else { 0.0 };
    let direction = if r_squared < 0.1 || slope == 0.0 {
        TrendDirection::Stable
    } else if slope > 0.0 {
        TrendDirection::Increasing
    } else {
        TrendDirection::Decreasing
    };
    TrendInfo { direction, slope, intercept: y_mean - slope * x_mean, r_squared }
}

/// Centred moving average; `None` where the window does not fit.
pub fn moving_average(values: &[f64], window: usize) -> Vec<Option<f64>> {
    let n = values.len();
    let half = window / 2;
    (0..n)
        .map(|i| {
            if i < half || i + window - half > n {
                return None;
            }
            Some(mean(&values[i - half..i - half + window]))
        })
        .collect()
}

/// Additive decomposition with a fixed period. Needs two full periods.
pub fn decompose(values: &[f64], period: usize) -> Option<TimeSeriesDecomposition> {
    if period < 2 || values.len() < period * 2 {
        return None;
    }
    let trend = moving_average(values, period);
    let mut sums = vec![0.0; period];
    let mut counts = vec![0usize; period];
    for (i, (v, t)) in values.iter().zip(&trend).enumerate() {
        if let Some(t) = t {
            sums[i % period] += v - t;
            counts[i % period] += 1;
        }
    }
    let mut indices: Vec<f64> = sums
        .iter()
        .zip(&counts)
        .map(|(s, c)| if *c > 0 { s / *c as f64 } else { 0.0 })
        .collect();
    let centre = mean(&indices);
    indices.iter_mut().for_each(|s| *s -= centre);

    let seasonal: Vec<f64> = (0..values.len()).map(|i| indices[i % period]).collect();
    let residual = values
        .iter()
        .zip(&trend)
        .zip(&seasonal)
        .map(|((v, t), s)| t.map(|t| v - t - s))
        .collect();
    Some(TimeSeriesDecomposition { period, trend, seasonal, residual })
}

pub fn autocorrelation(values: &[f64], lag: usize) -> f64 {
    let n = values.len();
    if lag == 0 || lag >= n {
        return if lag == 0 { 1.0 } else { 0.0 };
    }
    let m = mean(values);
    let denom: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    if denom <= 0.0 {
        return 0.0;
    }
    let num: f64 = (0..n - lag).map(|i| (values[i] - m) * (values[i + lag] - m)).sum();
    num / denom
}

/// Strongest local autocorrelation peak between lag 2 and n/2.
pub fn detect_seasonality(values: &[f64]) -> Seasonality {
    let max_lag = (values.len() / 2).min(PERIOD * 2);
    let acf: Vec<f64> = (0..=max_lag + 1).map(|lag| autocorrelation(values, lag)).collect();
    let peak = (2..=max_lag)
        .filter(|lag| acf[*lag] > acf[lag - 1] && acf[*lag] >= acf[lag + 1])
        .max_by(|a, b| acf[*a].total_cmp(&acf[*b]));
    match peak {
        Some(lag) if acf[lag] > SEASONALITY_MIN_ACF => {
            Seasonality { detected: true, period: Some(lag), strength: acf[lag] }
        }
        _ => Seasonality { detected: false, period: None, strength: peak.map_or(0.0, |l| acf[l].max(0.0)) },
    }
}

/// Two-sided tabular CUSUM on the standardized series. Reports the index
/// where either sum crosses the threshold, then restarts both sums.
pub fn cusum(values: &[f64]) -> Vec<(usize, TrendDirection)> {
    let m = mean(values);
    let s = population_std_dev(values);
    if s <= f64::EPSILON {
        return Vec::new();
    }
    let (mut high, mut low) = (0.0f64, 0.0f64);
    let mut points = Vec::new();
    for (i, v) in values.iter().enumerate() {
        let z = (v - m) / s;
        high = (high + z - CUSUM_SLACK).max(0.0);
        low = (low - z - CUSUM_SLACK).max(0.0);
        if high > CUSUM_THRESHOLD {
            points.push((i, TrendDirection::Increasing));
            high = 0.0;
            low = 0.0;
        } else if low > CUSUM_THRESHOLD {
            points.push((i, TrendDirection::Decreasing));
            high = 0.0;
            low = 0.0;
        }
    }
    points
}

/// Projects first differences that decay from the last observed difference
/// back to the mean difference. Bands widen with sqrt(step).
pub fn forecast(values: &[f64], horizon: usize) -> Forecast {
    let diffs: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    let mean_diff = mean(&diffs);
    let sigma = std_dev(&diffs);
    let mut last_diff = diffs.last().copied().unwrap_or(0.0);
    let mut level = values.last().copied().unwrap_or(0.0);

    let points = (1..=horizon)
        .map(|step| {
            last_diff = mean_diff + (last_diff - mean_diff) * REVERSION;
            level += last_diff;
            let band = Z_95 * sigma * (step as f64).sqrt();
            ForecastPoint { step, value: level, lower: level - band, upper: level + band }
        })
        .collect();
    Forecast { method: "difference_mean_reversion".to_string(), horizon, points }
}

fn format_date(date: &NaiveDateTime) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Analyses a series. Points are sorted by time here; callers may pass them
/// in row order.
pub fn analyze(
    date_column: &str,
    value_column: &str,
    mut series: Vec<(NaiveDateTime, f64)>,
    horizon: usize,
) -> Option<TimeSeriesAnalysis> {
    if series.len() < MIN_POINTS {
        return None;
    }
    series.sort_by(|a, b| a.0.cmp(&b.0));
    let values: Vec<f64> = series.iter().map(|(_, v)| *v).collect();

    let changepoints = cusum(&values)
        .into_iter()
        .map(|(index, direction)| Changepoint { index, date: format_date(&series[index].0), direction })
        .collect();

    Some(TimeSeriesAnalysis {
        date_column: date_column.to_string(),
        value_column: value_column.to_string(),
        points: values.len(),
        start: format_date(&series[0].0),
        end: format_date(&series[series.len() - 1].0),
        trend: linear_trend(&values),
        decomposition: decompose(&values, PERIOD),
        seasonality: detect_seasonality(&values),
        changepoints,
        forecast: forecast(&values, horizon),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn monthly(values: &[f64]) -> Vec<(NaiveDateTime, f64)> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let date = NaiveDate::from_ymd_opt(2020 + (i / 12) as i32, (i % 12) as u32 + 1, 1)
                    .unwrap()
                    .and_hms_opt(0, 0, 0)
                    .unwrap();
                (date, *v)
            })
            .collect()
    }

    fn seasonal_series(n: usize, slope: f64) -> Vec<f64> {
        (0..n)
            .map(|i| 100.0 + i as f64 * slope + 10.0 * (2.0 * std::f64::consts::PI * i as f64 / 12.0).sin())
            .collect()
    }

    #[test]
    fn linear_trend_direction() {
        let up: Vec<f64> = (0..20).map(|i| 2.0 * i as f64 + 1.0).collect();
        let trend = linear_trend(&up);
        assert_eq!(trend.direction, TrendDirection::Increasing);
        assert!((trend.slope - 2.0).abs() < 1e-9);
        assert!((trend.r_squared - 1.0).abs() < 1e-9);
        assert_eq!(linear_trend(&[5.0; 10]).direction, TrendDirection::Stable);
    }

    #[test]
    fn monthly_seasonality_is_found() {
        let values = seasonal_series(48, 0.0);
        let season = detect_seasonality(&values);
        assert!(season.detected);
        assert_eq!(season.period, Some(12));

        let parts = decompose(&values, 12).unwrap();
        assert_eq!(parts.trend.iter().filter(|t| t.is_none()).count(), 11);
        let peak = parts.seasonal[..12].iter().cloned().fold(f64::MIN, f64::max);
        assert!(peak > 8.0 && peak < 12.0);
        assert!(decompose(&values[..20], 12).is_none());
    }

    #[test]
    fn level_shift_triggers_cusum() {
        let mut values = vec![10.0; 30];
        values.extend(vec![20.0; 30]);
        let points = cusum(&values);
        assert!(!points.is_empty());
        assert!(points.iter().any(|(i, d)| *i >= 30 && *d == TrendDirection::Increasing));
        assert!(cusum(&[3.0; 12]).is_empty());
    }

    #[test]
    fn forecast_continues_steady_growth() {
        let values: Vec<f64> = (0..24).map(|i| 10.0 + 3.0 * i as f64).collect();
        let f = forecast(&values, 4);
        assert_eq!(f.points.len(), 4);
        assert!((f.points[0].value - 82.0).abs() < 1e-9);
        assert!((f.points[3].value - 91.0).abs() < 1e-9);
        // constant differences have no spread
        assert!((f.points[3].upper - f.points[3].lower).abs() < 1e-9);
    }

    #[test]
    fn analysis_sorts_by_date() {
        let mut series = monthly(&seasonal_series(36, 0.5));
        series.reverse();
        let analysis = analyze("Month", "Sales", series, 6).unwrap();
        assert_eq!(analysis.start, "2020-01-01");
        assert_eq!(analysis.trend.direction, TrendDirection::Increasing);
        assert_eq!(analysis.forecast.points.len(), 6);
        assert!(analyze("d", "v", monthly(&[1.0, 2.0]), 3).is_none());
    }
}
