use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use chrono::NaiveDateTime;
use serde::{Serialize, Serializer};
use smallvec::SmallVec;

use crate::error::EngineError;
use crate::services::stats::descriptive::{AdvancedColumnStats, NumericSummary};
use crate::services::stats::outliers::AnomalyRecord;
use crate::services::stats::timeseries::Forecast;

pub const SAMPLE_SIZE: usize = 3;
pub const TOP_VALUES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SheetFormat {
    Xls,
    Xlsx,
    Xlsm,
    Xlsb,
}

impl SheetFormat {
    /// Resolves the format from the file extension. Anything else is rejected
    /// before any I/O happens.
    pub fn from_path(path: &Path) -> Result<Self, EngineError> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "xls" => Ok(SheetFormat::Xls),
            "xlsx" => Ok(SheetFormat::Xlsx),
            "xlsm" => Ok(SheetFormat::Xlsm),
            "xlsb" => Ok(SheetFormat::Xlsb),
            "" => Err(EngineError::UnsupportedFormat(format!(
                "{} has no file extension",
                path.display()
            ))),
            other => Err(EngineError::UnsupportedFormat(format!(".{} is not a spreadsheet format", other))),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            SheetFormat::Xls => "xls",
            SheetFormat::Xlsx => "xlsx",
            SheetFormat::Xlsm => "xlsm",
            SheetFormat::Xlsb => "xlsb",
        }
    }

    /// Zip containers whose worksheets are XML parts.
    pub fn has_xml_worksheets(&self) -> bool {
        matches!(self, SheetFormat::Xlsx | SheetFormat::Xlsm)
    }

    pub fn is_zip_container(&self) -> bool {
        !matches!(self, SheetFormat::Xls)
    }
}

/// A decoded cell. Independent of the decoding backend so every parser tier
/// produces the same shape.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    Number(f64),
    Text(String),
    Bool(bool),
    Date(NaiveDateTime),
    Error(String),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            CellValue::Text(s) => parse_number(s),
            _ => None,
        }
    }
}

/// Parses plain and lightly formatted numbers ("1,234.5", "$12", "45%").
pub fn parse_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(v) = trimmed.parse::<f64>() {
        return v.is_finite().then_some(v);
    }
    let cleaned: String = trimmed
        .trim_start_matches(['$', '€', '£'])
        .trim_end_matches('%')
        .chars()
        .filter(|c| *c != ',')
        .collect();
    if cleaned.is_empty() || cleaned == "-" {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Empty => Ok(()),
            CellValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            CellValue::Text(s) => f.write_str(s),
            CellValue::Bool(b) => write!(f, "{}", b),
            CellValue::Date(d) => {
                if d.time() == chrono::NaiveTime::MIN {
                    write!(f, "{}", d.format("%Y-%m-%d"))
                } else {
                    write!(f, "{}", d.format("%Y-%m-%d %H:%M:%S"))
                }
            }
            CellValue::Error(e) => f.write_str(e),
        }
    }
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CellValue::Empty => serializer.serialize_none(),
            CellValue::Number(n) => serializer.serialize_f64(*n),
            CellValue::Bool(b) => serializer.serialize_bool(*b),
            other => serializer.collect_str(other),
        }
    }
}

/// One worksheet as produced by a decoder, before profiling.
#[derive(Debug, Clone, Default)]
pub struct RawSheet {
    pub name: String,
    /// Position of the sheet in the workbook.
    pub index: usize,
    pub rows: Vec<Vec<CellValue>>,
    pub total_columns: usize,
    pub formula_cells: usize,
    /// Set when this sheet alone could not be decoded.
    pub error: Option<String>,
}

impl RawSheet {
    pub fn failed(name: impl Into<String>, index: usize, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Structured,
    ContainerXml,
    BinaryScan,
    Placeholder,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkbookMetadata {
    pub author: Option<String>,
    pub title: Option<String>,
    pub sheet_names: Vec<String>,
    pub has_formulas: bool,
    pub has_charts: bool,
    pub has_images: bool,
    pub has_macros: bool,
    /// Sheets beyond `maxSheets` that were not decoded.
    pub skipped_sheets: usize,
}

/// Output of the tiered parser. Every tier fills the same fields.
#[derive(Debug, Clone)]
pub struct ParsedWorkbook {
    pub content: String,
    pub sheets: Vec<RawSheet>,
    pub metadata: WorkbookMetadata,
    pub confidence: f64,
    pub extraction_method: ExtractionMethod,
    /// Tiers that were tried and failed before this one succeeded.
    pub fallbacks: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Number,
    Date,
    Boolean,
    Text,
    Mixed,
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingMethod {
    Full,
    Stratified,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingInfo {
    pub method: SamplingMethod,
    /// Percentage of original data rows retained, never above 100.
    pub coverage: f64,
    pub sampled_rows: usize,
    pub original_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueCount {
    pub value: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramBin {
    pub start: f64,
    pub end: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Distribution {
    #[serde(rename_all = "camelCase")]
    Histogram {
        min: f64,
        max: f64,
        bin_width: f64,
        bins: Vec<HistogramBin>,
    },
    #[serde(rename_all = "camelCase")]
    Temporal {
        earliest: String,
        latest: String,
        years: BTreeMap<String, usize>,
        months: BTreeMap<String, usize>,
        days: BTreeMap<String, usize>,
        weekdays: BTreeMap<String, usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnProfile {
    pub index: usize,
    pub name: String,
    /// Normalized identifier, unique within the sheet.
    pub key: String,
    pub inferred_type: ColumnType,
    /// Majority vote, meaningful when `inferred_type` is `mixed`.
    pub dominant_type: ColumnType,
    pub non_empty: usize,
    pub null_count: usize,
    pub unique_count: usize,
    pub top_values: SmallVec<[ValueCount; TOP_VALUES]>,
    pub sample_values: SmallVec<[String; SAMPLE_SIZE]>,
    pub statistics: Option<NumericSummary>,
    pub distribution: Option<Distribution>,
    pub advanced: Option<AdvancedColumnStats>,
    pub anomalies: Vec<AnomalyRecord>,
    pub forecast: Option<Forecast>,
}

/// Profiled sheet. `rows` is always the original row count, even when `data`
/// holds a sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetProfile {
    pub name: String,
    pub index: usize,
    pub rows: usize,
    pub columns: usize,
    pub cells: usize,
    pub has_headers: bool,
    pub headers: Vec<String>,
    pub data: Vec<Vec<CellValue>>,
    pub data_types: BTreeMap<ColumnType, usize>,
    pub column_profiles: Vec<ColumnProfile>,
    pub sampling: SamplingInfo,
    pub formula_cells: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SheetProfile {
    /// Zeroed record for a sheet that failed to decode or profile.
    pub fn failed(name: &str, index: usize, error: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            index,
            rows: 0,
            columns: 0,
            cells: 0,
            has_headers: false,
            headers: Vec::new(),
            data: Vec::new(),
            data_types: BTreeMap::new(),
            column_profiles: Vec::new(),
            sampling: SamplingInfo {
                method: SamplingMethod::Full,
                coverage: 0.0,
                sampled_rows: 0,
                original_rows: 0,
            },
            formula_cells: 0,
            error: Some(error.into()),
        }
    }

    pub fn columns_of(&self, kind: ColumnType) -> impl Iterator<Item = &ColumnProfile> {
        self.column_profiles.iter().filter(move |c| c.inferred_type == kind)
    }

    /// Cell at `(row, col)` of the retained data rows.
    pub fn cell(&self, row: usize, col: usize) -> &CellValue {
        static EMPTY: CellValue = CellValue::Empty;
        self.data.get(row).and_then(|r| r.get(col)).unwrap_or(&EMPTY)
    }

    /// Keeps at most `limit` preview rows.
    pub fn truncate_preview(&mut self, limit: usize) {
        self.data.truncate(limit);
    }
}
