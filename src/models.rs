use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::AnalysisOptions;
use crate::error::{EngineError, ErrorType};
use crate::services::cache::CacheStats;
use crate::services::excel::types::{ColumnType, ExtractionMethod, SheetFormat, SheetProfile, WorkbookMetadata};
use crate::services::stats::AdvancedAnalysis;
use crate::services::strategy::{AnalysisStrategy, StrategyKind};
use crate::services::worker_pool::PoolStatus;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicInfo {
    pub file_name: String,
    pub size: u64,
    pub format: SheetFormat,
    pub modified: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Structure {
    pub sheets: usize,
    pub total_rows: usize,
    pub total_columns: usize,
    pub total_cells: usize,
    pub sheet_details: Vec<SheetProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternDetection {
    pub kind: String,
    pub sheet: String,
    pub column: String,
    pub matches: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentStatistics {
    pub numeric_columns: usize,
    pub text_columns: usize,
    pub date_columns: usize,
    pub filled_cells: usize,
    pub empty_cells: usize,
    /// Share of non-empty cells across retained data rows, 0-100.
    pub fill_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessInsights {
    /// 0-100.
    pub data_quality_score: f64,
    pub empty_columns: Vec<String>,
    pub large_sheets: Vec<String>,
    pub mixed_type_columns: Vec<String>,
    pub insights: Vec<String>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSection {
    pub language: String,
    pub data_types: BTreeMap<ColumnType, usize>,
    pub patterns: Vec<PatternDetection>,
    pub statistics: ContentStatistics,
    pub business_insights: BusinessInsights,
    pub confidence: f64,
    pub extraction_method: ExtractionMethod,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fallbacks: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    ConsecutiveEmptyRows,
    HighEmptyRowRatio,
    LowCompleteness,
    NumbersStoredAsText,
    SheetUnreadable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationEntry {
    pub sheet: String,
    pub kind: IssueKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataValidation {
    pub is_complete: bool,
    /// Non-empty share of data cells, 0-1.
    pub completeness_rate: f64,
    pub verified_cells: usize,
    pub total_data_cells: usize,
    pub issues: Vec<ValidationEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySnapshot {
    pub rss_bytes: Option<u64>,
    pub cache_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkFailure {
    pub chunk: usize,
    pub error_type: ErrorType,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSummary {
    pub processed_chunks: usize,
    pub total_chunks: usize,
    pub failures: Vec<ChunkFailure>,
    /// Set when every chunk failed and the whole file was re-read in memory.
    pub fell_back: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Performance {
    pub strategy: StrategyKind,
    pub duration_ms: u64,
    pub parse_ms: u64,
    pub analysis_ms: u64,
    pub cache_hit: bool,
    pub memory: MemorySnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub success: bool,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub basic_info: Option<BasicInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_strategy: Option<AnalysisStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structure: Option<Structure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<WorkbookMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advanced_analysis: Option<AdvancedAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_validation: Option<DataValidation>,
    pub partial_failure: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<ChunkSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance: Option<Performance>,
}

impl AnalysisResult {
    /// The result for a failed analysis. `analyze` reports errors this way
    /// instead of returning them.
    pub fn failure(path: &str, err: &EngineError) -> Self {
        Self {
            success: false,
            path: path.to_string(),
            error: Some(err.to_string()),
            error_type: Some(err.error_type()),
            basic_info: None,
            analysis_strategy: None,
            structure: None,
            metadata: None,
            content: None,
            analysis: None,
            advanced_analysis: None,
            data_validation: None,
            partial_failure: false,
            chunks: None,
            performance: None,
        }
    }

    pub fn processed_chunks(&self) -> Option<(usize, usize)> {
        self.chunks.as_ref().map(|c| (c.processed_chunks, c.total_chunks))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// One entry per input path, in input order.
    pub results: Vec<AnalysisResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortResult {
    pub success: bool,
    pub aborted: bool,
    pub message: String,
    /// Tasks that stopped within the grace period.
    pub terminated: usize,
    /// Tasks still running when the grace period ran out.
    pub forced: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub worker_pool: PoolStatus,
    pub cache: CacheStats,
    pub memory: MemorySnapshot,
    pub settings: AnalysisOptions,
}

/// Resident set size from `/proc/self/statm`, where available.
pub fn resident_memory() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * 4096)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_carry_error_type() {
        let err = EngineError::UnsupportedFormat(".csv is not a spreadsheet format".into());
        let result = AnalysisResult::failure("data.csv", &err);
        assert!(!result.success);
        assert_eq!(result.error_type, Some(ErrorType::UnsupportedFormat));

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["errorType"], "UnsupportedFormat");
        assert_eq!(json["success"], false);
        assert!(json.get("structure").is_none());
    }
}
