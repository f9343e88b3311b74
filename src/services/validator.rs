//! Completeness and integrity checks for workbooks that must not silently
//! lose cells (financial statements and the like).

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::AnalysisOptions;
use crate::models::{DataValidation, IssueKind, ValidationEntry};
use crate::services::excel::types::{CellValue, ColumnType, SheetProfile};

/// Runs of empty rows at least this long are reported.
const EMPTY_RUN: usize = 5;
/// Trailing rows excluded from the empty-run scan.
const TAIL_ROWS: usize = 10;
const EMPTY_ROW_RATIO: f64 = 0.3;
const MIN_COMPLETENESS: f64 = 0.7;
const WORKBOOK: &str = "(workbook)";

static FINANCIAL_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(financ|invoice|budget|ledger|balance|payroll|revenue|expense|account|statement|fiscal|profit|cash ?flow|p&l|tax|receivable|payable)",
    )
    .expect("valid regex")
});

/// Whether a file gets validated: always in precision mode, otherwise when
/// its name looks like a financial document.
pub fn should_validate(path: &Path, options: &AnalysisOptions) -> bool {
    if options.precision_mode {
        return true;
    }
    path.file_name()
        .map(|n| FINANCIAL_NAME.is_match(&n.to_string_lossy()))
        .unwrap_or(false)
}

fn row_is_empty(row: &[CellValue]) -> bool {
    row.iter().all(CellValue::is_empty)
}

/// Start and length of every run of at least `EMPTY_RUN` empty rows that
/// lies outside the final `TAIL_ROWS` rows.
fn empty_runs(rows: &[Vec<CellValue>]) -> Vec<(usize, usize)> {
    let scanned = rows.len().saturating_sub(TAIL_ROWS);
    let mut runs = Vec::new();
    let mut start = None;
    for (i, row) in rows[..scanned].iter().enumerate() {
        match (row_is_empty(row), start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                if i - s >= EMPTY_RUN {
                    runs.push((s, i - s));
                }
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        if scanned - s >= EMPTY_RUN {
            runs.push((s, scanned - s));
        }
    }
    runs
}

fn check_sheet(sheet: &SheetProfile, issues: &mut Vec<ValidationEntry>) -> (usize, usize) {
    let mut issue = |kind, message: String| {
        issues.push(ValidationEntry { sheet: sheet.name.clone(), kind, message });
    };

    if let Some(err) = &sheet.error {
        issue(IssueKind::SheetUnreadable, format!("Sheet could not be read: {}", err));
        return (0, 0);
    }

    let rows = &sheet.data;
    let runs = empty_runs(rows);
    if let Some((start, len)) = runs.iter().max_by_key(|(_, len)| *len) {
        issue(
            IssueKind::ConsecutiveEmptyRows,
            format!(
                "{} run(s) of {}+ consecutive empty rows; longest is {} rows starting at data row {}",
                runs.len(),
                EMPTY_RUN,
                len,
                start + 1
            ),
        );
    }

    let empty_rows = rows.iter().filter(|r| row_is_empty(r)).count();
    if rows.len() > TAIL_ROWS {
        let ratio = empty_rows as f64 / rows.len() as f64;
        if ratio > EMPTY_ROW_RATIO {
            issue(
                IssueKind::HighEmptyRowRatio,
                format!("{:.1}% of rows are empty ({} of {})", ratio * 100.0, empty_rows, rows.len()),
            );
        }
    }

    for column in sheet.columns_of(ColumnType::Number) {
        let as_text = rows
            .iter()
            .filter(|r| matches!(r.get(column.index), Some(CellValue::Text(s)) if s.trim().parse::<f64>().is_ok()))
            .count();
        if as_text > 0 {
            issue(
                IssueKind::NumbersStoredAsText,
                format!("Column '{}' has {} numbers stored as text", column.name, as_text),
            );
        }
    }

    let total = rows.len() * sheet.columns;
    let verified = rows.iter().flatten().filter(|c| !c.is_empty()).count();
    (verified, total)
}

/// Walks every retained data row of every sheet. Problems are reported as
/// issues, never as errors.
pub fn validate(sheets: &[SheetProfile]) -> DataValidation {
    let mut issues = Vec::new();
    let (mut verified_cells, mut total_data_cells) = (0, 0);
    for sheet in sheets {
        let (verified, total) = check_sheet(sheet, &mut issues);
        verified_cells += verified;
        total_data_cells += total;
    }

    let completeness_rate = if total_data_cells == 0 {
        0.0
    } else {
        verified_cells as f64 / total_data_cells as f64
    };
    let is_complete = completeness_rate >= MIN_COMPLETENESS;
    if !is_complete {
        issues.push(ValidationEntry {
            sheet: WORKBOOK.to_string(),
            kind: IssueKind::LowCompleteness,
            message: format!(
                "Only {:.1}% of data cells are filled ({} of {})",
                completeness_rate * 100.0,
                verified_cells,
                total_data_cells
            ),
        });
    }

    tracing::info!(
        "Validation: {}/{} cells verified, {} issues",
        verified_cells,
        total_data_cells,
        issues.len()
    );
    DataValidation { is_complete, completeness_rate, verified_cells, total_data_cells, issues }
}
