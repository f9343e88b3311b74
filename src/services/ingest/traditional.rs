use bytes::Bytes;

use super::{decode_and_profile, IngestContext, IngestOutput, ProgressStage, READ_BUDGET};
use crate::error::EngineError;
use crate::services::excel::parser::DecodeRequest;

/// Reads the whole file into memory and decodes it as one task.
pub async fn run(ctx: &IngestContext) -> Result<IngestOutput, EngineError> {
    ctx.report(ProgressStage::Reading, 0.0, 0);
    let data = Bytes::from(tokio::fs::read(&ctx.path).await?);
    ctx.report(ProgressStage::Reading, READ_BUDGET, data.len() as u64);
    process(ctx, data).await
}

/// Decodes a buffer that is already in memory.
pub async fn process(ctx: &IngestContext, data: Bytes) -> Result<IngestOutput, EngineError> {
    let bytes = data.len() as u64;
    ctx.report(ProgressStage::Parsing, READ_BUDGET, bytes);

    let parser = ctx.parser.clone();
    let options = ctx.options.clone();
    let format = ctx.format;
    let request = DecodeRequest::new(options.max_sheets);
    let job = ctx.pool.next_job();
    let decoded = ctx
        .pool
        .submit_within(job, 0, ctx.task_timeout(), move |token| {
            decode_and_profile(&parser, &data, format, &request, &options, &token)
        })
        .await?;

    tracing::debug!(
        "Decoded {} sheets from {} ({} bytes)",
        decoded.profiles.len(),
        ctx.path.display(),
        bytes
    );
    ctx.report(ProgressStage::Analyzing, 90.0, bytes);
    Ok(decoded.into())
}
