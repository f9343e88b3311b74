pub mod clustering;
pub mod correlation;
pub mod descriptive;
pub mod outliers;
pub mod patterns;
pub mod pca;
pub mod timeseries;

use rayon::prelude::*;
use serde::Serialize;

use crate::config::AnalysisOptions;
use crate::services::excel::types::{ColumnType, SheetProfile};
use crate::services::excel::utils::cell_as_date;
use clustering::ClusteringReport;
use correlation::{CategoricalSeries, CorrelationReport, NumericSeries};
use outliers::Severity;
use patterns::PatternReport;
use pca::PcaResult;
use timeseries::TimeSeriesAnalysis;

/// Categorical columns with more distinct values than this are treated as
/// free text and left out of association analysis.
const CATEGORICAL_LIMIT: usize = 50;
const MAX_SERIES_PER_SHEET: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetAdvancedAnalysis {
    pub sheet: String,
    pub anomaly_count: usize,
    pub critical_anomalies: usize,
    pub correlations: CorrelationReport,
    pub clustering: Option<ClusteringReport>,
    pub dimension_reduction: Option<PcaResult>,
    pub time_series: Vec<TimeSeriesAnalysis>,
    pub patterns: PatternReport,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvancedSummary {
    pub total_anomalies: usize,
    pub critical_anomalies: usize,
    pub strong_correlations: usize,
    pub clustered_sheets: usize,
    pub time_series: usize,
    pub association_rules: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvancedAnalysis {
    pub sheets: Vec<SheetAdvancedAnalysis>,
    pub summary: AdvancedSummary,
}

/// Column values pulled out of a profiled sheet, aligned by data row.
struct SheetColumns {
    numeric: Vec<(String, usize, Vec<Option<f64>>)>,
    categorical: Vec<(String, Vec<Option<String>>)>,
    date: Option<(String, usize)>,
}

fn extract_columns(sheet: &SheetProfile) -> SheetColumns {
    let rows = sheet.data.len();
    let mut numeric = Vec::new();
    let mut categorical = Vec::new();
    let mut date = None;

    for profile in &sheet.column_profiles {
        let col = profile.index;
        match profile.inferred_type {
            ColumnType::Number => {
                let values = (0..rows).map(|r| sheet.cell(r, col).as_f64()).collect();
                numeric.push((profile.name.clone(), col, values));
            }
            ColumnType::Text | ColumnType::Boolean
                if profile.unique_count >= 2
                    && profile.unique_count <= CATEGORICAL_LIMIT
                    && profile.unique_count < profile.non_empty =>
            {
                let values = (0..rows)
                    .map(|r| {
                        let cell = sheet.cell(r, col);
                        (!cell.is_empty()).then(|| cell.to_string().trim().to_string())
                    })
                    .collect();
                categorical.push((profile.name.clone(), values));
            }
            ColumnType::Date if date.is_none() => date = Some((profile.name.clone(), col)),
            _ => {}
        }
    }
    SheetColumns { numeric, categorical, date }
}

/// Rows that have every numeric feature, standardized per feature.
fn complete_feature_rows(numeric: &[(String, usize, Vec<Option<f64>>)]) -> (Vec<Vec<f64>>, Vec<Vec<f64>>) {
    let rows = numeric.first().map_or(0, |(_, _, v)| v.len());
    let complete: Vec<usize> = (0..rows)
        .filter(|r| numeric.iter().all(|(_, _, v)| v[*r].is_some()))
        .collect();
    let columns: Vec<Vec<f64>> = numeric
        .iter()
        .map(|(_, _, v)| complete.iter().filter_map(|r| v[*r]).collect())
        .collect();
    let standardized: Vec<Vec<f64>> = columns.iter().map(|c| descriptive::standardize(c)).collect();
    let points = (0..complete.len())
        .map(|i| standardized.iter().map(|c| c[i]).collect())
        .collect();
    (columns, points)
}

pub struct StatisticsEngine<'a> {
    options: &'a AnalysisOptions,
}

impl<'a> StatisticsEngine<'a> {
    pub fn new(options: &'a AnalysisOptions) -> Self {
        Self { options }
    }

    fn clustering_enabled(&self) -> bool {
        self.options.enable_clustering || self.options.enable_ml
    }

    fn time_series_enabled(&self) -> bool {
        self.options.enable_time_series || self.options.enable_ml
    }

    /// Runs the suite over every healthy sheet. Per-column results (shape
    /// statistics, anomalies, forecasts) are written back onto the profiles.
    pub fn run(&self, sheets: &mut [SheetProfile]) -> AdvancedAnalysis {
        let start = std::time::Instant::now();
        let results: Vec<SheetAdvancedAnalysis> = sheets
            .par_iter_mut()
            .filter(|s| s.error.is_none() && !s.data.is_empty())
            .map(|s| self.analyze_sheet(s))
            .collect();

        let mut summary = AdvancedSummary::default();
        for result in &results {
            summary.total_anomalies += result.anomaly_count;
            summary.critical_anomalies += result.critical_anomalies;
            summary.strong_correlations += result.correlations.network.edges.len();
            summary.clustered_sheets += usize::from(result.clustering.is_some());
            summary.time_series += result.time_series.len();
            summary.association_rules += result.patterns.association_rules.len();
        }

        tracing::info!(
            "Statistics suite finished for {} sheets in {:?}",
            results.len(),
            start.elapsed()
        );
        AdvancedAnalysis { sheets: results, summary }
    }

    pub fn analyze_sheet(&self, sheet: &mut SheetProfile) -> SheetAdvancedAnalysis {
        let columns = extract_columns(sheet);
        tracing::debug!(
            "Sheet '{}': {} numeric, {} categorical columns",
            sheet.name,
            columns.numeric.len(),
            columns.categorical.len()
        );

        let (mut anomaly_count, mut critical_anomalies) = (0, 0);
        for (_, col, values) in &columns.numeric {
            let (rows, present): (Vec<usize>, Vec<f64>) =
                values.iter().enumerate().filter_map(|(r, v)| v.map(|v| (r, v))).unzip();
            let report = outliers::detect(&present);
            if let Some(profile) = sheet.column_profiles.iter_mut().find(|p| p.index == *col) {
                profile.advanced = descriptive::advanced(&present);
                profile.anomalies = report
                    .anomalies
                    .into_iter()
                    .map(|mut a| {
                        a.index = rows[a.index];
                        a
                    })
                    .collect();
                anomaly_count += profile.anomalies.len();
                critical_anomalies +=
                    profile.anomalies.iter().filter(|a| a.severity == Severity::Critical).count();
            }
        }

        // Rows in time order when the sheet has a date column.
        let order: Vec<usize> = match &columns.date {
            Some((_, col)) => {
                let mut order: Vec<usize> = (0..sheet.data.len()).collect();
                order.sort_by_key(|r| {
                    let date = cell_as_date(sheet.cell(*r, *col));
                    (date.is_none(), date)
                });
                order
            }
            None => (0..sheet.data.len()).collect(),
        };
        let ordered_categorical: Vec<(String, Vec<Option<String>>)> = columns
            .categorical
            .iter()
            .map(|(name, values)| (name.clone(), order.iter().map(|r| values[*r].clone()).collect()))
            .collect();

        let numeric_series: Vec<NumericSeries<'_>> = columns
            .numeric
            .iter()
            .map(|(name, _, values)| NumericSeries { name, values })
            .collect();
        let categorical_series: Vec<CategoricalSeries<'_>> = ordered_categorical
            .iter()
            .map(|(name, values)| CategoricalSeries { name, values })
            .collect();
        // correlation pairs rows positionally, so use the unordered columns there
        let unordered_categorical: Vec<CategoricalSeries<'_>> = columns
            .categorical
            .iter()
            .map(|(name, values)| CategoricalSeries { name, values })
            .collect();

        let correlations = correlation::analyze(
            &numeric_series,
            &unordered_categorical,
            self.options.correlation_threshold,
        );
        let patterns = patterns::analyze(&categorical_series, self.options.min_support);

        let names: Vec<String> = columns.numeric.iter().map(|(n, _, _)| n.clone()).collect();
        let (raw_columns, points) = complete_feature_rows(&columns.numeric);

        let clustering = if self.clustering_enabled() && !names.is_empty() {
            clustering::analyze(
                names.clone(),
                &points,
                self.options.max_clusters,
                self.options.dbscan_min_pts,
                self.options.linkage,
            )
        } else {
            None
        };

        let dimension_reduction = if self.options.enable_ml {
            pca::analyze(names, &raw_columns)
        } else {
            None
        };

        let mut time_series = Vec::new();
        if let (true, Some((date_name, date_col))) = (self.time_series_enabled(), &columns.date) {
            for (name, col, values) in columns.numeric.iter().take(MAX_SERIES_PER_SHEET) {
                let series: Vec<_> = values
                    .iter()
                    .enumerate()
                    .filter_map(|(r, v)| Some((cell_as_date(sheet.cell(r, *date_col))?, (*v)?)))
                    .collect();
                if let Some(analysis) =
                    timeseries::analyze(date_name, name, series, self.options.forecast_horizon)
                {
                    if let Some(profile) = sheet.column_profiles.iter_mut().find(|p| p.index == *col) {
                        profile.forecast = Some(analysis.forecast.clone());
                    }
                    time_series.push(analysis);
                }
            }
        }

        SheetAdvancedAnalysis {
            sheet: sheet.name.clone(),
            anomaly_count,
            critical_anomalies,
            correlations,
            clustering,
            dimension_reduction,
            time_series,
            patterns,
        }
    }
}
