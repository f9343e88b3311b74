use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};

use chrono::Datelike;
use rayon::prelude::*;
use smallvec::SmallVec;

use super::types::*;
use super::utils::*;
use crate::config::AnalysisOptions;
use crate::services::stats::descriptive::{histogram, summarize};

const HISTOGRAM_BINS: usize = 10;
const HEAD_SHARE: f64 = 0.4;
const TAIL_SHARE: f64 = 0.4;

/// Profiles decoded sheets: header detection, sampling, per-column type
/// inference, distributions and summary statistics.
pub struct SheetAnalyzer<'a> {
    options: &'a AnalysisOptions,
}

/// Header present iff the first row has strictly more text cells than the
/// second, and at least one.
pub fn detect_headers(rows: &[Vec<CellValue>]) -> bool {
    let text_cells = |row: Option<&Vec<CellValue>>| {
        row.map_or(0, |r| r.iter().filter(|c| is_text_cell(c)).count())
    };
    let first = text_cells(rows.first());
    first > 0 && first > text_cells(rows.get(1))
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplePlan {
    pub method: SamplingMethod,
    /// Ascending data-row indices to keep.
    pub rows: Vec<usize>,
    pub original_rows: usize,
}

impl SamplePlan {
    pub fn info(&self) -> SamplingInfo {
        let coverage = if self.original_rows == 0 {
            100.0
        } else {
            (self.rows.len() as f64 / self.original_rows as f64 * 100.0).min(100.0)
        };
        SamplingInfo {
            method: self.method,
            coverage,
            sampled_rows: self.rows.len(),
            original_rows: self.original_rows,
        }
    }
}

/// Full pass when `total <= max`; otherwise 40% of the budget from the head,
/// 20% strided across the middle third and 40% from the tail.
pub fn plan_sample(total: usize, max: usize) -> SamplePlan {
    if total <= max {
        return SamplePlan { method: SamplingMethod::Full, rows: (0..total).collect(), original_rows: total };
    }
    let head = (max as f64 * HEAD_SHARE) as usize;
    let tail = (max as f64 * TAIL_SHARE) as usize;
    let middle = max - head - tail;

    let middle_start = (total / 3).max(head);
    let middle_end = (total * 2 / 3).min(total - tail).max(middle_start);
    let span = middle_end - middle_start;

    let mut rows: Vec<usize> = (0..head).collect();
    if span > 0 && middle > 0 {
        let taken = middle.min(span);
        let stride = span as f64 / taken as f64;
        rows.extend((0..taken).map(|i| middle_start + (i as f64 * stride) as usize));
    }
    rows.extend(total - tail..total);
    SamplePlan { method: SamplingMethod::Stratified, rows, original_rows: total }
}

/// Majority vote over non-empty cells. One distinct vote gives that type,
/// more than one gives `mixed` with the majority as dominant type. Returns
/// `(inferred, dominant)`.
pub fn infer_column_type(cells: &[&CellValue]) -> (ColumnType, ColumnType) {
    let votes: BTreeMap<ColumnType, usize> = cells
        .par_iter()
        .fold(BTreeMap::new, |mut votes, cell| {
            if let Some(kind) = classify_cell(cell) {
                *votes.entry(kind).or_insert(0) += 1;
            }
            votes
        })
        .reduce(BTreeMap::new, |mut a, b| {
            for (kind, count) in b {
                *a.entry(kind).or_insert(0) += count;
            }
            a
        });

    // 1/0 next to boolean words are flags, not numbers
    if votes.len() == 2 && votes.contains_key(&ColumnType::Boolean) && votes.contains_key(&ColumnType::Number) {
        let binary = cells
            .iter()
            .filter(|c| classify_cell(c) == Some(ColumnType::Number))
            .all(|c| matches!(c.as_f64(), Some(v) if v == 0.0 || v == 1.0));
        if binary {
            return (ColumnType::Boolean, ColumnType::Boolean);
        }
    }

    let dominant = votes
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map_or(ColumnType::Empty, |(kind, _)| *kind);
    match votes.len() {
        0 => (ColumnType::Empty, ColumnType::Empty),
        1 => (dominant, dominant),
        _ => (ColumnType::Mixed, dominant),
    }
}

fn temporal_distribution(cells: &[&CellValue]) -> Option<Distribution> {
    let dates: Vec<_> = cells.iter().filter_map(|c| cell_as_date(c)).collect();
    let earliest = dates.iter().min()?;
    let latest = dates.iter().max()?;
    let mut years = BTreeMap::new();
    let mut months = BTreeMap::new();
    let mut days = BTreeMap::new();
    let mut weekdays = BTreeMap::new();
    for d in &dates {
        *years.entry(d.year().to_string()).or_insert(0) += 1;
        *months.entry(format!("{:02}", d.month())).or_insert(0) += 1;
        *days.entry(format!("{:02}", d.day())).or_insert(0) += 1;
        *weekdays.entry(weekday_label(d)).or_insert(0) += 1;
    }
    Some(Distribution::Temporal {
        earliest: CellValue::Date(*earliest).to_string(),
        latest: CellValue::Date(*latest).to_string(),
        years,
        months,
        days,
        weekdays,
    })
}

fn top_values(counts: HashMap<String, usize>) -> SmallVec<[ValueCount; TOP_VALUES]> {
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
        .into_iter()
        .take(TOP_VALUES)
        .map(|(value, count)| ValueCount { value, count })
        .collect()
}

impl<'a> SheetAnalyzer<'a> {
    pub fn new(options: &'a AnalysisOptions) -> Self {
        Self { options }
    }

    /// Never fails: a sheet that cannot be profiled comes back zeroed with
    /// its error recorded.
    pub fn analyze(&self, raw: &RawSheet) -> SheetProfile {
        if let Some(err) = &raw.error {
            tracing::warn!("Sheet '{}' could not be decoded: {}", raw.name, err);
            return SheetProfile::failed(&raw.name, raw.index, err.clone());
        }
        match catch_unwind(AssertUnwindSafe(|| self.profile(raw))) {
            Ok(profile) => profile,
            Err(_) => {
                tracing::warn!("Profiling sheet '{}' failed, returning an empty record", raw.name);
                SheetProfile::failed(&raw.name, raw.index, "sheet profiling failed")
            }
        }
    }

    pub fn analyze_all(&self, sheets: &[RawSheet]) -> Vec<SheetProfile> {
        let start = std::time::Instant::now();
        let profiles: Vec<SheetProfile> = sheets.par_iter().map(|s| self.analyze(s)).collect();
        tracing::info!("Profiled {} sheets in {:?}", profiles.len(), start.elapsed());
        profiles
    }

    fn profile(&self, raw: &RawSheet) -> SheetProfile {
        let columns = raw
            .rows
            .iter()
            .map(Vec::len)
            .max()
            .unwrap_or(0)
            .max(raw.total_columns);
        let has_headers = self.options.force_headers || detect_headers(&raw.rows);
        let skip = usize::from(has_headers && !raw.rows.is_empty());

        let mut existing_names = HashSet::new();
        let headers: Vec<String> = (0..columns)
            .map(|i| {
                let label = if has_headers {
                    raw.rows.first().and_then(|r| r.get(i)).map(|c| c.to_string()).unwrap_or_default()
                } else {
                    String::new()
                };
                if label.trim().is_empty() {
                    format!("Column {}", i + 1)
                } else {
                    label.trim().to_string()
                }
            })
            .collect();
        let keys: Vec<String> = headers.iter().map(|h| clean_column_name(h, &mut existing_names)).collect();

        let data_rows = &raw.rows[skip.min(raw.rows.len())..];
        let plan = plan_sample(data_rows.len(), self.options.max_rows_per_sheet);
        let data: Vec<Vec<CellValue>> = plan
            .rows
            .iter()
            .map(|i| {
                let mut row = data_rows[*i].clone();
                row.resize(columns, CellValue::Empty);
                row
            })
            .collect();

        let column_profiles: Vec<ColumnProfile> = (0..columns)
            .into_par_iter()
            .map(|col| {
                let cells: Vec<&CellValue> = data.iter().map(|r| &r[col]).collect();
                self.analyze_column(col, &headers[col], &keys[col], &cells)
            })
            .collect();

        let mut data_types = BTreeMap::new();
        for profile in &column_profiles {
            *data_types.entry(profile.inferred_type).or_insert(0) += 1;
        }

        tracing::debug!(
            "Sheet '{}': {} rows x {} columns, sampling {:?}",
            raw.name,
            raw.rows.len(),
            columns,
            plan.method
        );

        SheetProfile {
            name: raw.name.clone(),
            index: raw.index,
            rows: raw.rows.len(),
            columns,
            cells: raw.rows.len() * columns,
            has_headers,
            headers,
            data,
            data_types,
            column_profiles,
            sampling: plan.info(),
            formula_cells: raw.formula_cells,
            error: None,
        }
    }

    pub fn analyze_column(&self, index: usize, name: &str, key: &str, cells: &[&CellValue]) -> ColumnProfile {
        let (null_count, counts) = cells
            .par_iter()
            .fold(
                || (0, HashMap::new()),
                |(mut nulls, mut seen): (usize, HashMap<String, usize>), value| {
                    if value.is_empty() {
                        nulls += 1;
                    } else {
                        *seen.entry(value.to_string().trim().to_string()).or_insert(0) += 1;
                    }
                    (nulls, seen)
                },
            )
            .reduce(
                || (0, HashMap::new()),
                |a, b| {
                    let mut combined = a.1;
                    for (value, count) in b.1 {
                        *combined.entry(value).or_insert(0) += count;
                    }
                    (a.0 + b.0, combined)
                },
            );

        let sample_values: SmallVec<[String; SAMPLE_SIZE]> = cells
            .iter()
            .filter(|c| !c.is_empty())
            .take(SAMPLE_SIZE)
            .map(|c| c.to_string())
            .collect();

        let (inferred_type, dominant_type) = infer_column_type(cells);
        let (statistics, distribution) = match inferred_type {
            ColumnType::Number => {
                let values: Vec<f64> = cells.iter().filter_map(|c| c.as_f64()).collect();
                let summary = summarize(&values);
                let distribution = summary.as_ref().map(|s| {
                    let (bin_width, bins) = histogram(&values, HISTOGRAM_BINS);
                    Distribution::Histogram { min: s.min, max: s.max, bin_width, bins }
                });
                (summary, distribution)
            }
            ColumnType::Date => (None, temporal_distribution(cells)),
            _ => (None, None),
        };

        ColumnProfile {
            index,
            name: name.to_string(),
            key: key.to_string(),
            inferred_type,
            dominant_type,
            non_empty: cells.len() - null_count,
            null_count,
            unique_count: counts.len(),
            top_values: top_values(counts),
            sample_values,
            statistics,
            distribution,
            advanced: None,
            anomalies: Vec::new(),
            forecast: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> CellValue {
        if s.is_empty() {
            CellValue::Empty
        } else {
            CellValue::Text(s.to_string())
        }
    }

    fn infer(values: &[&str]) -> ColumnType {
        let cells: Vec<CellValue> = values.iter().map(|v| text(v)).collect();
        let refs: Vec<&CellValue> = cells.iter().collect();
        infer_column_type(&refs).0
    }

    #[test]
    fn inference_votes() {
        assert_eq!(infer(&["1", "2", "3"]), ColumnType::Number);
        assert_eq!(infer(&["2024-01-01", "2024-02-01"]), ColumnType::Date);
        assert_eq!(infer(&["1", "a"]), ColumnType::Mixed);
        assert_eq!(infer(&["yes", "no", "1", "0"]), ColumnType::Boolean);
        assert_eq!(infer(&["", " "]), ColumnType::Empty);
        assert_eq!(infer(&["15/03/2024", "", "01.02.2023"]), ColumnType::Date);
    }

    #[test]
    fn mixed_column_reports_dominant_type() {
        let cells = [text("1"), text("2"), text("x")];
        let refs: Vec<&CellValue> = cells.iter().collect();
        assert_eq!(infer_column_type(&refs), (ColumnType::Mixed, ColumnType::Number));
    }

    #[test]
    fn header_rule() {
        let rows = vec![
            vec![text("Name"), text("Amount")],
            vec![text("Alice"), CellValue::Number(3.0)],
        ];
        assert!(detect_headers(&rows));
        let equal = vec![vec![text("a"), text("b")], vec![text("c"), text("d")]];
        assert!(!detect_headers(&equal));
        let numeric = vec![vec![CellValue::Number(1.0)], vec![CellValue::Number(2.0)]];
        assert!(!detect_headers(&numeric));
    }

    #[test]
    fn large_sheets_are_stratified() {
        let plan = plan_sample(2_000_000, 1_000_000);
        let info = plan.info();
        assert_eq!(info.method, SamplingMethod::Stratified);
        assert!(info.coverage < 100.0);
        assert_eq!(info.original_rows, 2_000_000);
        assert_eq!(plan.rows.len(), 1_000_000);
        assert!(plan.rows.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(plan.rows[0], 0);
        assert_eq!(*plan.rows.last().unwrap(), 1_999_999);
        let middle = plan.rows.iter().filter(|r| (666_666..1_333_333).contains(*r)).count();
        assert_eq!(middle, 200_000);

        let full = plan_sample(500_000, 1_000_000).info();
        assert_eq!(full.method, SamplingMethod::Full);
        assert_eq!(full.coverage, 100.0);
    }

    #[test]
    fn profile_keeps_original_row_count() {
        let mut rows = vec![vec![text("Qty"), text("Day")]];
        for i in 0..30 {
            rows.push(vec![CellValue::Number(f64::from(i)), text(&format!("2024-01-{:02}", i + 1))]);
        }
        let raw = RawSheet { name: "S".into(), index: 0, total_columns: 2, rows, ..Default::default() };
        let options = AnalysisOptions { max_rows_per_sheet: 10, ..Default::default() };
        let profile = SheetAnalyzer::new(&options).analyze(&raw);

        assert_eq!(profile.rows, 31);
        assert_eq!(profile.data.len(), 10);
        assert_eq!(profile.sampling.method, SamplingMethod::Stratified);
        assert!(profile.has_headers);
        assert_eq!(profile.headers, vec!["Qty", "Day"]);
        assert_eq!(profile.column_profiles[1].inferred_type, ColumnType::Date);
        match &profile.column_profiles[1].distribution {
            Some(Distribution::Temporal { years, .. }) => assert_eq!(years["2024"], 10),
            other => panic!("unexpected distribution {:?}", other),
        }
    }

    #[test]
    fn numeric_column_gets_histogram_and_summary() {
        let cells: Vec<CellValue> = (0..100).map(|i| CellValue::Number(f64::from(i))).collect();
        let refs: Vec<&CellValue> = cells.iter().collect();
        let options = AnalysisOptions::default();
        let column = SheetAnalyzer::new(&options).analyze_column(0, "n", "n", &refs);
        assert_eq!(column.unique_count, 100);
        assert_eq!(column.statistics.as_ref().unwrap().max, 99.0);
        match column.distribution {
            Some(Distribution::Histogram { bins, .. }) => assert_eq!(bins.len(), 10),
            other => panic!("unexpected distribution {:?}", other),
        }
        assert_eq!(column.sample_values.as_slice(), &["0", "1", "2"]);
    }

    #[test]
    fn top_values_break_ties_by_value() {
        let cells = [text("b"), text("a"), text("b"), text("a"), text("c")];
        let refs: Vec<&CellValue> = cells.iter().collect();
        let options = AnalysisOptions::default();
        let column = SheetAnalyzer::new(&options).analyze_column(0, "t", "t", &refs);
        assert_eq!(column.top_values[0].value, "a");
        assert_eq!(column.top_values[1].value, "b");
        assert_eq!(column.top_values[2].count, 1);
    }

    #[test]
    fn undecodable_sheet_is_zeroed() {
        let raw = RawSheet::failed("Bad", 2, "corrupt");
        let options = AnalysisOptions::default();
        let profile = SheetAnalyzer::new(&options).analyze(&raw);
        assert_eq!(profile.rows, 0);
        assert_eq!(profile.error.as_deref(), Some("corrupt"));
    }
}
