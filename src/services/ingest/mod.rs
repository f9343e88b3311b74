//! Ingestion adapters. Each one gets the workbook bytes to the tiered parser
//! and the sheet analyzer in its own way, and hands back the same output.

pub mod parallel;
pub mod streaming;
pub mod traditional;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::AnalysisOptions;
use crate::error::EngineError;
use crate::models::ChunkSummary;
use crate::services::excel::analyzer::SheetAnalyzer;
use crate::services::excel::parser::{DecodeRequest, TieredParser};
use crate::services::excel::types::{ParsedWorkbook, SheetFormat, SheetProfile};
use crate::services::worker_pool::WorkerPool;

/// Share of the progress range covered by reading the file.
pub const READ_BUDGET: f64 = 70.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStage {
    Reading,
    Parsing,
    Analyzing,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub stage: ProgressStage,
    /// 0-100.
    pub percent: f64,
    pub bytes_processed: u64,
}

pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Everything an adapter needs for one analysis run.
#[derive(Clone)]
pub struct IngestContext {
    pub path: PathBuf,
    pub size: u64,
    pub format: SheetFormat,
    pub options: Arc<AnalysisOptions>,
    pub parser: Arc<TieredParser>,
    pub pool: Arc<WorkerPool>,
    /// Fires when the engine is aborted during this run.
    pub cancel: CancellationToken,
    pub progress: Option<ProgressCallback>,
}

impl IngestContext {
    pub fn report(&self, stage: ProgressStage, percent: f64, bytes_processed: u64) {
        if let Some(progress) = &self.progress {
            progress(ProgressUpdate { stage, percent: percent.clamp(0.0, 100.0), bytes_processed });
        }
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.options.timeout)
    }
}

/// Parsed and profiled sheets from one decode (a whole file or one chunk).
#[derive(Debug, Clone)]
pub struct DecodedChunk {
    /// Parser output with `sheets` moved into `profiles`.
    pub parsed: ParsedWorkbook,
    pub profiles: Vec<SheetProfile>,
    pub parse_ms: u64,
    pub analysis_ms: u64,
}

#[derive(Debug, Clone)]
pub struct IngestOutput {
    pub decoded: DecodedChunk,
    /// Present for parallel runs.
    pub chunks: Option<ChunkSummary>,
}

impl From<DecodedChunk> for IngestOutput {
    fn from(decoded: DecodedChunk) -> Self {
        Self { decoded, chunks: None }
    }
}

/// Decode then profile. Runs on a worker thread; checks the token between
/// the two phases.
pub fn decode_and_profile(
    parser: &TieredParser,
    data: &Bytes,
    format: SheetFormat,
    request: &DecodeRequest,
    options: &AnalysisOptions,
    token: &CancellationToken,
) -> Result<DecodedChunk, EngineError> {
    let start = Instant::now();
    let mut parsed = parser.parse(data, format, request)?;
    let parse_ms = start.elapsed().as_millis() as u64;

    if token.is_cancelled() {
        return Err(EngineError::Aborted);
    }

    let start = Instant::now();
    let sheets = std::mem::take(&mut parsed.sheets);
    let profiles = SheetAnalyzer::new(options).analyze_all(&sheets);
    Ok(DecodedChunk {
        parsed,
        profiles,
        parse_ms,
        analysis_ms: start.elapsed().as_millis() as u64,
    })
}
