//! Reader, progress and collector stages joined by bounded channels. A slow
//! stage stalls the one before it, so at most `CHANNEL_DEPTH` chunks are in
//! flight between any two stages.

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use super::{traditional, IngestContext, IngestOutput, ProgressStage, READ_BUDGET};
use crate::error::EngineError;

const CHANNEL_DEPTH: usize = 4;
/// Progress is reported each time another 5% of the bytes has passed.
const PROGRESS_STEP: f64 = 5.0;

pub async fn run(ctx: &IngestContext) -> Result<IngestOutput, EngineError> {
    let data = stream_file(ctx).await?;
    tracing::info!("Streamed {} bytes from {}", data.len(), ctx.path.display());
    traditional::process(ctx, data).await
}

/// Runs the three stages to completion and returns the collected bytes.
/// Workbook containers are only decodable once complete, so the collector
/// keeps the bounded stream until it ends.
pub async fn stream_file(ctx: &IngestContext) -> Result<Bytes, EngineError> {
    let (raw_tx, raw_rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
    let (tracked_tx, tracked_rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);

    let (_, _, data) = tokio::try_join!(
        read_stage(ctx, raw_tx),
        progress_stage(ctx, raw_rx, tracked_tx),
        collect_stage(tracked_rx, ctx.size, ctx.options.max_file_size),
    )?;
    Ok(data)
}

async fn read_stage(ctx: &IngestContext, tx: mpsc::Sender<Bytes>) -> Result<(), EngineError> {
    let mut file = tokio::fs::File::open(&ctx.path).await?;
    loop {
        if ctx.cancel.is_cancelled() {
            return Err(EngineError::Aborted);
        }
        let mut buf = BytesMut::with_capacity(ctx.options.chunk_size);
        let n = file.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        if tx.send(buf.freeze()).await.is_err() {
            // downstream failed; its error is the one reported
            return Ok(());
        }
    }
}

async fn progress_stage(
    ctx: &IngestContext,
    mut rx: mpsc::Receiver<Bytes>,
    tx: mpsc::Sender<Bytes>,
) -> Result<(), EngineError> {
    let total = ctx.size.max(1) as f64;
    let mut consumed = 0u64;
    let mut next_mark = PROGRESS_STEP;

    while let Some(chunk) = rx.recv().await {
        consumed += chunk.len() as u64;
        let done = consumed as f64 / total * 100.0;
        if done >= next_mark {
            while next_mark <= done {
                next_mark += PROGRESS_STEP;
            }
            let percent = (done.min(100.0) / 100.0 * READ_BUDGET).min(READ_BUDGET);
            ctx.report(ProgressStage::Reading, percent, consumed);
        }
        if tx.send(chunk).await.is_err() {
            return Ok(());
        }
    }
    Ok(())
}

async fn collect_stage(mut rx: mpsc::Receiver<Bytes>, expected: u64, limit: u64) -> Result<Bytes, EngineError> {
    let mut buffer = BytesMut::with_capacity(expected.min(limit) as usize);
    while let Some(chunk) = rx.recv().await {
        let size = (buffer.len() + chunk.len()) as u64;
        // the file may have grown since it was stat'ed
        if size > limit {
            return Err(EngineError::SizeLimitExceeded { size, limit });
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}
