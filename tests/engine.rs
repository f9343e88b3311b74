mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use common::{n, sales_sheet, t, write_xlsx, Cell, Sheet};
use sheet_engine::services::excel::parser::{DecodeRequest, TieredParser};
use sheet_engine::services::excel::types::{ColumnType, SheetFormat};
use sheet_engine::services::ingest::parallel::{ChunkProcessor, SheetChunkProcessor};
use sheet_engine::services::ingest::DecodedChunk;
use sheet_engine::services::strategy::StrategyKind;
use sheet_engine::{AnalysisEngine, AnalysisOptions, EngineError, ErrorType, ProgressStage, ProgressUpdate};

fn engine(options: AnalysisOptions) -> AnalysisEngine {
    AnalysisEngine::new(options).unwrap()
}

/// Fails the chunks it is told to, delegates the rest.
struct FailingChunks {
    inner: SheetChunkProcessor,
    failing: Vec<usize>,
}

impl FailingChunks {
    fn new(failing: Vec<usize>) -> Arc<Self> {
        Arc::new(Self { inner: SheetChunkProcessor::new(Arc::new(TieredParser::new())), failing })
    }
}

impl ChunkProcessor for FailingChunks {
    fn process(
        &self,
        chunk: usize,
        data: &Bytes,
        format: SheetFormat,
        request: &DecodeRequest,
        options: &AnalysisOptions,
        token: &CancellationToken,
    ) -> Result<DecodedChunk, EngineError> {
        if self.failing.contains(&chunk) {
            return Err(EngineError::WorkerCrash { chunk, reason: "simulated failure".into() });
        }
        self.inner.process(chunk, data, format, request, options, token)
    }
}

/// Spins until cancelled.
struct StuckChunks;

impl ChunkProcessor for StuckChunks {
    fn process(
        &self,
        _chunk: usize,
        _data: &Bytes,
        _format: SheetFormat,
        _request: &DecodeRequest,
        _options: &AnalysisOptions,
        token: &CancellationToken,
    ) -> Result<DecodedChunk, EngineError> {
        while !token.is_cancelled() {
            std::thread::sleep(Duration::from_millis(5));
        }
        Err(EngineError::Aborted)
    }
}

fn four_sheets(dir: &std::path::Path) -> std::path::PathBuf {
    let sheets: Vec<Sheet> = (0..4).map(|i| sales_sheet(&format!("Q{}", i + 1), 10 + i)).collect();
    write_xlsx(dir, "quarters.xlsx", &sheets)
}

#[tokio::test]
async fn small_workbook_is_profiled() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_xlsx(dir.path(), "sales.xlsx", &[sales_sheet("Jan", 20), sales_sheet("Feb", 10)]);

    let result = engine(AnalysisOptions::default()).analyze(&path).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.analysis_strategy.as_ref().unwrap().kind, StrategyKind::Traditional);

    let structure = result.structure.as_ref().unwrap();
    assert_eq!(structure.sheets, 2);
    assert_eq!(structure.total_rows, 21 + 11);
    assert_eq!(structure.total_columns, 3);

    let jan = &structure.sheet_details[0];
    assert_eq!(jan.name, "Jan");
    assert!(jan.has_headers);
    let types: Vec<ColumnType> = jan.column_profiles.iter().map(|c| c.inferred_type).collect();
    assert_eq!(types, vec![ColumnType::Text, ColumnType::Number, ColumnType::Date]);

    let metadata = result.metadata.as_ref().unwrap();
    assert_eq!(metadata.sheet_names, vec!["Jan", "Feb"]);
    let analysis = result.analysis.as_ref().unwrap();
    assert!(analysis.confidence >= 0.9);
    assert_eq!(analysis.language, "en");
    assert!(result.data_validation.is_none());
}

#[tokio::test]
async fn second_analysis_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_xlsx(dir.path(), "cached.xlsx", &[sales_sheet("Data", 30)]);
    let engine = engine(AnalysisOptions::default());

    let first = engine.analyze(&path).await;
    let mut second = engine.analyze(&path).await;
    assert!(!first.performance.as_ref().unwrap().cache_hit);
    assert!(second.performance.as_ref().unwrap().cache_hit);

    second.performance.as_mut().unwrap().cache_hit = false;
    assert_eq!(serde_json::to_string(&first).unwrap(), serde_json::to_string(&second).unwrap());

    let status = engine.system_status();
    assert_eq!(status.cache.entries, 1);
    assert_eq!(status.cache.hits, 1);
}

#[tokio::test]
async fn cleared_cache_recomputes() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_xlsx(dir.path(), "cleared.xlsx", &[sales_sheet("Data", 10)]);
    let engine = engine(AnalysisOptions::default());

    engine.analyze(&path).await;
    engine.clear_cache();
    assert_eq!(engine.system_status().cache.entries, 0);
    assert_eq!(engine.system_status().cache.bytes, 0);

    let again = engine.analyze(&path).await;
    assert!(again.success);
    assert!(!again.performance.unwrap().cache_hit);
}

#[tokio::test]
async fn cache_can_be_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_xlsx(dir.path(), "nocache.xlsx", &[sales_sheet("Data", 5)]);
    let engine = engine(AnalysisOptions { enable_cache: false, ..Default::default() });
    engine.analyze(&path).await;
    let second = engine.analyze(&path).await;
    assert!(!second.performance.unwrap().cache_hit);
    assert_eq!(engine.system_status().cache.entries, 0);
}

#[tokio::test]
async fn column_types_are_inferred() {
    let dir = tempfile::tempdir().unwrap();
    let rows = vec![
        vec![t("Num"), t("When"), t("Mixed")],
        vec![t("1"), t("2024-01-01"), t("1")],
        vec![t("2"), t("2024-02-01"), t("a")],
        vec![t("3"), t("2024-03-01"), Cell::Empty],
    ];
    let path = write_xlsx(dir.path(), "types.xlsx", &[Sheet::new("T", rows)]);

    let result = engine(AnalysisOptions::default()).analyze(&path).await;
    let structure = result.structure.unwrap();
    let sheet = &structure.sheet_details[0];
    let types: Vec<ColumnType> = sheet.column_profiles.iter().map(|c| c.inferred_type).collect();
    assert_eq!(types, vec![ColumnType::Number, ColumnType::Date, ColumnType::Mixed]);
    assert_eq!(sheet.data_types[&ColumnType::Mixed], 1);
}

#[tokio::test]
async fn financial_workbook_with_gaps_fails_validation() {
    let dir = tempfile::tempdir().unwrap();
    let mut rows = vec![vec![t("Account"), t("Debit"), t("Credit")]];
    let entry = |i: usize| vec![t(&format!("ACC-{}", i)), n(10.0 * i as f64), n(5.0)];
    rows.extend((0..3).map(entry));
    rows.extend((0..10).map(|_| Vec::new()));
    rows.extend((3..15).map(entry));
    let path = write_xlsx(dir.path(), "general_ledger.xlsx", &[Sheet::new("GL", rows)]);

    let result = engine(AnalysisOptions::default()).analyze(&path).await;
    assert!(result.success);
    let validation = result.data_validation.expect("ledger files are validated");
    assert!(!validation.is_complete);
    assert!(validation.completeness_rate < 0.7);
    assert!(validation.issues.len() >= 3);
}

#[tokio::test]
async fn precision_mode_validates_any_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_xlsx(dir.path(), "recipes.xlsx", &[sales_sheet("Data", 12)]);
    let result = engine(AnalysisOptions { precision_mode: true, ..Default::default() })
        .analyze(&path)
        .await;
    let validation = result.data_validation.unwrap();
    assert!(validation.is_complete);
    assert_eq!(validation.completeness_rate, 1.0);
}

#[tokio::test]
async fn unsupported_extension_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.csv");
    std::fs::write(&path, "a,b\n1,2\n").unwrap();

    let result = engine(AnalysisOptions::default()).analyze(&path).await;
    assert!(!result.success);
    assert_eq!(result.error_type, Some(ErrorType::UnsupportedFormat));
    assert!(result.structure.is_none());
}

#[tokio::test]
async fn oversized_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_xlsx(dir.path(), "big.xlsx", &[sales_sheet("Data", 50)]);
    let result = engine(AnalysisOptions { max_file_size: 100, ..Default::default() }).analyze(&path).await;
    assert!(!result.success);
    assert_eq!(result.error_type, Some(ErrorType::SizeLimitExceeded));
}

#[tokio::test]
async fn missing_file_is_an_io_error() {
    let result = engine(AnalysisOptions::default()).analyze("/definitely/not/here.xlsx").await;
    assert!(!result.success);
    assert_eq!(result.error_type, Some(ErrorType::IoError));
}

#[tokio::test]
async fn batch_keeps_input_order() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_xlsx(dir.path(), "a.xlsx", &[sales_sheet("A", 5)]);
    let b = write_xlsx(dir.path(), "b.xlsx", &[sales_sheet("B", 50)]);
    let csv = dir.path().join("c.csv");
    std::fs::write(&csv, "x").unwrap();
    let missing = dir.path().join("missing.xlsx");
    let paths = vec![b.clone(), csv.clone(), a.clone(), missing.clone()];

    let batch = engine(AnalysisOptions { batch_concurrency: 2, ..Default::default() })
        .analyze_batch(&paths)
        .await;
    assert_eq!((batch.total, batch.successful, batch.failed), (4, 2, 2));
    let order: Vec<String> = batch.results.iter().map(|r| r.path.clone()).collect();
    let expected: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
    assert_eq!(order, expected);
    assert_eq!(batch.results[1].error_type, Some(ErrorType::UnsupportedFormat));
}

#[tokio::test]
async fn parallel_run_survives_one_failed_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let path = four_sheets(dir.path());
    let options = AnalysisOptions { force_parallel: true, worker_count: 4, ..Default::default() };

    let result = engine(options).with_chunk_processor(FailingChunks::new(vec![2])).analyze(&path).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.analysis_strategy.as_ref().unwrap().kind, StrategyKind::Parallel);
    assert!(result.partial_failure);
    assert_eq!(result.processed_chunks(), Some((3, 4)));

    let chunks = result.chunks.as_ref().unwrap();
    assert_eq!(chunks.failures.len(), 1);
    assert_eq!(chunks.failures[0].chunk, 2);
    assert_eq!(chunks.failures[0].error_type, ErrorType::WorkerCrash);

    let structure = result.structure.as_ref().unwrap();
    let names: Vec<&str> = structure.sheet_details.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["Q1", "Q2", "Q3", "Q4"]);
    assert!(structure.sheet_details[2].error.is_some());
    assert_eq!(structure.total_rows, 11 + 12 + 14);
}

#[tokio::test]
async fn parallel_run_falls_back_when_every_chunk_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = four_sheets(dir.path());
    let options = AnalysisOptions { force_parallel: true, worker_count: 4, ..Default::default() };

    let result = engine(options)
        .with_chunk_processor(FailingChunks::new(vec![0, 1, 2, 3]))
        .analyze(&path)
        .await;
    assert!(result.success);
    assert!(!result.partial_failure);
    let chunks = result.chunks.as_ref().unwrap();
    assert!(chunks.fell_back);
    assert_eq!(chunks.failures.len(), 4);
    assert_eq!(result.structure.unwrap().sheets, 4);
}

#[tokio::test]
async fn parallel_and_traditional_agree() {
    let dir = tempfile::tempdir().unwrap();
    let path = four_sheets(dir.path());

    let serial = engine(AnalysisOptions::default()).analyze(&path).await;
    let parallel = engine(AnalysisOptions { force_parallel: true, ..Default::default() }).analyze(&path).await;
    assert_eq!(
        serde_json::to_value(&serial.structure).unwrap(),
        serde_json::to_value(&parallel.structure).unwrap()
    );
    assert!(!parallel.partial_failure);
    assert_eq!(parallel.processed_chunks(), Some((4, 4)));
}

#[tokio::test]
async fn abort_stops_running_analysis() {
    let dir = tempfile::tempdir().unwrap();
    let path = four_sheets(dir.path());
    let options = AnalysisOptions { force_parallel: true, worker_count: 4, abort_grace_ms: 2_000, ..Default::default() };
    let engine = engine(options).with_chunk_processor(Arc::new(StuckChunks));

    let (result, abort) = tokio::join!(engine.analyze(&path), async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        engine.abort().await
    });

    assert!(abort.success);
    assert!(abort.aborted);
    assert_eq!(abort.forced, 0);
    assert!(!result.success);
    assert_eq!(result.error_type, Some(ErrorType::Aborted));

    let status = engine.system_status();
    assert_eq!(status.worker_pool.active, 0);
    assert_eq!(status.worker_pool.aborts, 1);
}

#[tokio::test]
async fn engine_is_usable_after_abort() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_xlsx(dir.path(), "after.xlsx", &[sales_sheet("Data", 5)]);
    let engine = engine(AnalysisOptions::default());
    let abort = engine.abort().await;
    assert!(abort.success && abort.aborted);
    assert_eq!(abort.terminated, 0);
    assert!(engine.analyze(&path).await.success);
}

#[tokio::test]
async fn forced_streaming_reports_progress() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_xlsx(dir.path(), "stream.xlsx", &[sales_sheet("Data", 200)]);
    let updates: Arc<Mutex<Vec<ProgressUpdate>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = updates.clone();

    let options = AnalysisOptions { force_streaming: true, chunk_size: 512, ..Default::default() };
    let result = engine(options).with_progress(Arc::new(move |u: ProgressUpdate| sink.lock().push(u))).analyze(&path).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.analysis_strategy.unwrap().kind, StrategyKind::Streaming);
    assert_eq!(result.structure.unwrap().total_rows, 201);

    let updates = updates.lock();
    assert!(updates.iter().filter(|u| u.stage == ProgressStage::Reading).all(|u| u.percent <= 70.0));
    assert!(updates.windows(2).all(|w| w[0].percent <= w[1].percent));
    let last = updates.last().unwrap();
    assert_eq!(last.stage, ProgressStage::Complete);
    assert_eq!(last.percent, 100.0);
}

#[tokio::test]
async fn advanced_analysis_flags_outliers() {
    let dir = tempfile::tempdir().unwrap();
    let mut rows = vec![vec![t("Region"), t("Amount"), t("Units")]];
    for i in 0..80 {
        let amount = if i == 40 { 10_000.0 } else { 10.0 + (i % 5) as f64 * 0.5 };
        rows.push(vec![t(["North", "South"][i % 2]), n(amount), n(2.0 * amount + (i % 3) as f64)]);
    }
    let path = write_xlsx(dir.path(), "outliers.xlsx", &[Sheet::new("Data", rows)]);

    let result = engine(AnalysisOptions { enable_advanced_analysis: true, ..Default::default() })
        .analyze(&path)
        .await;
    assert!(result.success, "{:?}", result.error);
    let advanced = result.advanced_analysis.as_ref().expect("advanced analysis requested");
    assert!(advanced.summary.total_anomalies >= 1);
    assert!(advanced.summary.strong_correlations >= 1);

    let amount = &result.structure.as_ref().unwrap().sheet_details[0].column_profiles[1];
    assert!(amount.anomalies.iter().any(|a| a.value == 10_000.0));
    assert!(amount.advanced.is_some());
}

#[tokio::test]
async fn preview_rows_are_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_xlsx(dir.path(), "preview.xlsx", &[sales_sheet("Data", 300)]);
    let result = engine(AnalysisOptions { preview_rows: 25, ..Default::default() }).analyze(&path).await;
    let structure = result.structure.unwrap();
    let sheet = &structure.sheet_details[0];
    assert_eq!(sheet.data.len(), 25);
    assert_eq!(sheet.rows, 301);
}

#[test]
fn invalid_options_are_rejected_up_front() {
    let err = AnalysisEngine::new(AnalysisOptions { worker_count: 0, ..Default::default() }).err().unwrap();
    assert!(matches!(err, EngineError::InvalidConfiguration(_)));
}
