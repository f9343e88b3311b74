use std::path::Path;
use std::sync::Arc;
use std::time::{Instant, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};

use crate::config::AnalysisOptions;
use crate::error::EngineError;
use crate::models::{
    resident_memory, AbortResult, AnalysisResult, BasicInfo, BatchResult, MemorySnapshot, Performance, SystemStatus,
};
use crate::services::aggregator;
use crate::services::cache::{cache_key, AnalysisCache};
use crate::services::excel::parser::TieredParser;
use crate::services::excel::types::SheetFormat;
use crate::services::ingest::parallel::{ChunkProcessor, SheetChunkProcessor};
use crate::services::ingest::{
    parallel, streaming, traditional, DecodedChunk, IngestContext, IngestOutput, ProgressCallback, ProgressStage,
};
use crate::services::stats::StatisticsEngine;
use crate::services::strategy::{select_strategy, StrategyKind};
use crate::services::validator;
use crate::services::worker_pool::WorkerPool;

/// Entry point of the library. Owns its cache and worker pool; two engines
/// share nothing.
pub struct AnalysisEngine {
    options: AnalysisOptions,
    cache: AnalysisCache,
    pool: Arc<WorkerPool>,
    parser: Arc<TieredParser>,
    chunk_processor: Arc<dyn ChunkProcessor>,
    progress: Option<ProgressCallback>,
}

impl AnalysisEngine {
    pub fn new(options: AnalysisOptions) -> Result<Self, EngineError> {
        options.validate()?;
        let parser = Arc::new(TieredParser::new());
        tracing::info!(
            "Starting analysis engine with {} workers, cache of {} entries",
            options.worker_count,
            options.cache_size
        );
        Ok(Self {
            cache: AnalysisCache::from_options(&options),
            pool: Arc::new(WorkerPool::new(options.worker_count, options.timeout, options.abort_grace_ms)),
            chunk_processor: Arc::new(SheetChunkProcessor::new(parser.clone())),
            parser,
            progress: None,
            options,
        })
    }

    /// Replaces the per-chunk work of parallel runs.
    pub fn with_chunk_processor(mut self, processor: Arc<dyn ChunkProcessor>) -> Self {
        self.chunk_processor = processor;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn options(&self) -> &AnalysisOptions {
        &self.options
    }

    pub async fn analyze(&self, path: impl AsRef<Path>) -> AnalysisResult {
        self.analyze_with(path, &self.options).await
    }

    /// Analyzes one file with per-call options. Never fails: errors come back
    /// as `success: false` with an `errorType`.
    pub async fn analyze_with(&self, path: impl AsRef<Path>, options: &AnalysisOptions) -> AnalysisResult {
        let path = path.as_ref();
        let cancel = self.pool.cancellation();
        let outcome = tokio::select! {
            outcome = self.run(path, options, cancel.clone()) => outcome,
            _ = cancel.cancelled() => Err(EngineError::Aborted),
        };
        outcome.unwrap_or_else(|err| {
            tracing::warn!("Analysis of {} failed: {}", path.display(), err);
            AnalysisResult::failure(&path.display().to_string(), &err)
        })
    }

    async fn run(
        &self,
        path: &Path,
        options: &AnalysisOptions,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<AnalysisResult, EngineError> {
        let start = Instant::now();
        options.validate()?;
        let format = SheetFormat::from_path(path)?;
        let meta = tokio::fs::metadata(path).await?;
        let size = meta.len();
        let strategy = select_strategy(size, options)?;

        let modified = meta.modified().ok();
        let key = if options.enable_cache {
            let mtime = modified
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64);
            match cache_key(&path.display().to_string(), size, mtime, options) {
                Ok(key) => Some(key),
                Err(e) => {
                    tracing::warn!("Cannot fingerprint {}, skipping cache: {}", path.display(), e);
                    None
                }
            }
        } else {
            None
        };
        if let Some(hit) = key.as_deref().and_then(|k| self.cache.get(k)) {
            tracing::info!("Cache hit for {}", path.display());
            return Ok(hit);
        }

        tracing::info!(
            "Analyzing {} ({} bytes) with {:?} strategy: {}",
            path.display(),
            size,
            strategy.kind,
            strategy.reason
        );
        let ctx = IngestContext {
            path: path.to_path_buf(),
            size,
            format,
            options: Arc::new(options.clone()),
            parser: self.parser.clone(),
            pool: self.pool.clone(),
            cancel,
            progress: self.progress.clone(),
        };
        let IngestOutput { decoded, chunks } = match strategy.kind {
            StrategyKind::Traditional => traditional::run(&ctx).await?,
            StrategyKind::Streaming => streaming::run(&ctx).await?,
            StrategyKind::Parallel => parallel::run(&ctx, self.chunk_processor.clone()).await?,
        };
        let DecodedChunk { parsed, mut profiles, parse_ms, mut analysis_ms } = decoded;

        let advanced = if options.advanced_requested() {
            let stats_start = Instant::now();
            let working = profiles.clone();
            let stats_options = ctx.options.clone();
            let job = self.pool.next_job();
            let outcome = self
                .pool
                .submit_within(job, 0, ctx.task_timeout(), move |_| {
                    let mut working = working;
                    let advanced = StatisticsEngine::new(&stats_options).run(&mut working);
                    Ok((working, advanced))
                })
                .await;
            analysis_ms += stats_start.elapsed().as_millis() as u64;
            match outcome {
                Ok((enriched, advanced)) => {
                    profiles = enriched;
                    Some(advanced)
                }
                Err(EngineError::Aborted) => return Err(EngineError::Aborted),
                Err(e) => {
                    tracing::warn!("Advanced analysis of {} failed, continuing without it: {}", path.display(), e);
                    None
                }
            }
        } else {
            None
        };

        ctx.report(ProgressStage::Analyzing, 95.0, size);
        let analysis = aggregator::analysis_section(&profiles, &parsed, advanced.as_ref());
        let data_validation = validator::should_validate(path, options).then(|| validator::validate(&profiles));
        for profile in &mut profiles {
            profile.truncate_preview(options.preview_rows);
        }

        let partial_failure = chunks.as_ref().map_or(false, |c| !c.fell_back && !c.failures.is_empty());
        let result = AnalysisResult {
            success: true,
            path: path.display().to_string(),
            error: None,
            error_type: None,
            basic_info: Some(BasicInfo {
                file_name: path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
                size,
                format,
                modified: modified.map(|t| DateTime::<Utc>::from(t).to_rfc3339()),
            }),
            analysis_strategy: Some(strategy.clone()),
            structure: Some(aggregator::build_structure(profiles)),
            metadata: Some(parsed.metadata),
            content: Some(parsed.content),
            analysis: Some(analysis),
            advanced_analysis: advanced,
            data_validation,
            partial_failure,
            chunks,
            performance: Some(Performance {
                strategy: strategy.kind,
                duration_ms: start.elapsed().as_millis() as u64,
                parse_ms,
                analysis_ms,
                cache_hit: false,
                memory: MemorySnapshot { rss_bytes: resident_memory(), cache_bytes: self.cache.bytes() },
            }),
        };

        if let Some(key) = key {
            if let Err(e) = self.cache.put(key, &result) {
                tracing::warn!("Failed to cache result for {}: {}", path.display(), e);
            }
        }
        ctx.report(ProgressStage::Complete, 100.0, size);
        tracing::info!("Analyzed {} in {:?}", path.display(), start.elapsed());
        Ok(result)
    }

    pub async fn analyze_batch<P: AsRef<Path>>(&self, paths: &[P]) -> BatchResult {
        self.analyze_batch_with(paths, &self.options).await
    }

    /// At most `batchConcurrency` files are analyzed at once; results keep
    /// the order of `paths`.
    pub async fn analyze_batch_with<P: AsRef<Path>>(&self, paths: &[P], options: &AnalysisOptions) -> BatchResult {
        let results: Vec<AnalysisResult> = stream::iter(paths)
            .map(|p| self.analyze_with(p, options))
            .buffered(options.batch_concurrency.max(1))
            .collect()
            .await;
        let successful = results.iter().filter(|r| r.success).count();
        tracing::info!("Batch finished: {}/{} succeeded", successful, results.len());
        BatchResult { total: results.len(), successful, failed: results.len() - successful, results }
    }

    /// Cancels every in-flight analysis of this engine. The engine stays
    /// usable afterwards.
    pub async fn abort(&self) -> AbortResult {
        self.pool.abort().await
    }

    pub fn system_status(&self) -> SystemStatus {
        SystemStatus {
            worker_pool: self.pool.status(),
            cache: self.cache.stats(),
            memory: MemorySnapshot { rss_bytes: resident_memory(), cache_bytes: self.cache.bytes() },
            settings: self.options.clone(),
        }
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}
