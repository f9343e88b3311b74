use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use super::{decode_and_profile, traditional, DecodedChunk, IngestContext, IngestOutput, ProgressStage, READ_BUDGET};
use crate::config::AnalysisOptions;
use crate::error::EngineError;
use crate::models::{ChunkFailure, ChunkSummary};
use crate::services::excel::parser::{DecodeRequest, TieredParser};
use crate::services::excel::structured::sheet_names;
use crate::services::excel::types::{SheetFormat, SheetProfile};

/// Work done for one chunk on a worker thread.
pub trait ChunkProcessor: Send + Sync {
    fn process(
        &self,
        chunk: usize,
        data: &Bytes,
        format: SheetFormat,
        request: &DecodeRequest,
        options: &AnalysisOptions,
        token: &CancellationToken,
    ) -> Result<DecodedChunk, EngineError>;
}

/// Decodes and profiles the sheets named by the request.
pub struct SheetChunkProcessor {
    parser: Arc<TieredParser>,
}

impl SheetChunkProcessor {
    pub fn new(parser: Arc<TieredParser>) -> Self {
        Self { parser }
    }
}

impl ChunkProcessor for SheetChunkProcessor {
    fn process(
        &self,
        _chunk: usize,
        data: &Bytes,
        format: SheetFormat,
        request: &DecodeRequest,
        options: &AnalysisOptions,
        token: &CancellationToken,
    ) -> Result<DecodedChunk, EngineError> {
        decode_and_profile(&self.parser, data, format, request, options, token)
    }
}

/// Splits `count` sheets into at most `groups` contiguous, non-empty ranges
/// whose lengths differ by at most one.
pub fn partition(count: usize, groups: usize) -> Vec<Range<usize>> {
    let groups = groups.clamp(1, count.max(1));
    let (base, extra) = (count / groups, count % groups);
    let mut start = 0;
    (0..groups)
        .map(|g| {
            let len = base + usize::from(g < extra);
            let range = start..start + len;
            start += len;
            range
        })
        .filter(|r| !r.is_empty())
        .collect()
}

/// Combines chunk results. Order of `chunks` does not matter: sheets are
/// re-sorted by workbook position.
pub fn merge_chunks(chunks: Vec<DecodedChunk>) -> Option<DecodedChunk> {
    let mut chunks = chunks.into_iter();
    let mut merged = chunks.next()?;
    let mut contents = vec![(first_index(&merged.profiles), std::mem::take(&mut merged.parsed.content))];

    for chunk in chunks {
        contents.push((first_index(&chunk.profiles), chunk.parsed.content));
        if chunk.parsed.confidence < merged.parsed.confidence {
            merged.parsed.confidence = chunk.parsed.confidence;
            merged.parsed.extraction_method = chunk.parsed.extraction_method;
        }
        for fallback in chunk.parsed.fallbacks {
            if !merged.parsed.fallbacks.contains(&fallback) {
                merged.parsed.fallbacks.push(fallback);
            }
        }
        merged.parsed.metadata.has_formulas |= chunk.parsed.metadata.has_formulas;
        merged.profiles.extend(chunk.profiles);
        merged.parse_ms = merged.parse_ms.max(chunk.parse_ms);
        merged.analysis_ms = merged.analysis_ms.max(chunk.analysis_ms);
    }

    merged.profiles.sort_by_key(|p| p.index);
    contents.sort_by_key(|(index, _)| *index);
    merged.parsed.content = contents
        .into_iter()
        .map(|(_, c)| c)
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    Some(merged)
}

fn first_index(profiles: &[SheetProfile]) -> usize {
    profiles.iter().map(|p| p.index).min().unwrap_or(usize::MAX)
}

/// Reads the file once, then decodes contiguous groups of sheets as
/// independent pool tasks. Failed chunks are reported and their sheets kept
/// as empty records; if none succeed the whole buffer is decoded in one go.
pub async fn run(ctx: &IngestContext, processor: Arc<dyn ChunkProcessor>) -> Result<IngestOutput, EngineError> {
    ctx.report(ProgressStage::Reading, 0.0, 0);
    let data = Bytes::from(tokio::fs::read(&ctx.path).await?);
    let bytes = data.len() as u64;
    ctx.report(ProgressStage::Reading, READ_BUDGET, bytes);

    let names = match sheet_names(&data, ctx.format) {
        Ok(names) => names,
        Err(e) => {
            tracing::warn!("Cannot list sheets of {}, decoding in one pass: {}", ctx.path.display(), e);
            return traditional::process(ctx, data).await;
        }
    };
    let ranges = partition(names.len().min(ctx.options.max_sheets), ctx.options.worker_count);
    if ranges.len() < 2 {
        return traditional::process(ctx, data).await;
    }

    let total = ranges.len();
    let job = ctx.pool.next_job();
    let settled_count = AtomicUsize::new(0);
    tracing::info!("Dispatching {} chunks over {} sheets for {}", total, names.len(), ctx.path.display());

    let tasks = ranges.iter().cloned().enumerate().map(|(chunk, range)| {
        let processor = processor.clone();
        let data = data.clone();
        let options = ctx.options.clone();
        let format = ctx.format;
        let request = DecodeRequest::for_sheets(options.max_sheets, range.collect());
        let settled_count = &settled_count;
        async move {
            let outcome = ctx
                .pool
                .submit_within(job, chunk, ctx.task_timeout(), move |token| {
                    processor.process(chunk, &data, format, &request, &options, &token)
                })
                .await;
            let settled = settled_count.fetch_add(1, Ordering::SeqCst) + 1;
            let percent = READ_BUDGET + (90.0 - READ_BUDGET) * settled as f64 / total as f64;
            ctx.report(ProgressStage::Parsing, percent, bytes);
            outcome
        }
    });
    let settled = join_all(tasks).await;

    let mut successes = Vec::new();
    let mut failures = Vec::new();
    for (chunk, outcome) in settled.into_iter().enumerate() {
        match outcome {
            Ok(decoded) => successes.push(decoded),
            Err(EngineError::Aborted) => return Err(EngineError::Aborted),
            Err(e) => {
                tracing::warn!("Chunk {} of {} failed: {}", chunk, ctx.path.display(), e);
                failures.push(ChunkFailure { chunk, error_type: e.error_type(), message: e.to_string() });
            }
        }
    }

    let processed = successes.len();
    let Some(mut merged) = merge_chunks(successes) else {
        tracing::warn!("All {} chunks failed for {}, falling back to a single pass", total, ctx.path.display());
        let mut output = traditional::process(ctx, data).await?;
        output.chunks = Some(ChunkSummary { processed_chunks: 0, total_chunks: total, failures, fell_back: true });
        return Ok(output);
    };

    for failure in &failures {
        for index in ranges[failure.chunk].clone() {
            merged.profiles.push(SheetProfile::failed(
                &names[index],
                index,
                format!("chunk {} failed: {}", failure.chunk, failure.message),
            ));
        }
    }
    merged.profiles.sort_by_key(|p| p.index);

    ctx.report(ProgressStage::Analyzing, 90.0, bytes);
    Ok(IngestOutput {
        decoded: merged,
        chunks: Some(ChunkSummary { processed_chunks: processed, total_chunks: total, failures, fell_back: false }),
    })
}
