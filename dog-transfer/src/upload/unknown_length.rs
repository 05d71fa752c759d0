use std::sync::Arc;

use futures_core::Stream;
use futures_util::StreamExt;
use tracing::{debug, info, instrument};

use super::chunker::{part_chunks, PartChunk};
use super::multipart::{UploadPartOp, UploadSession};
use super::{put_single, UploadContext, UploadOutput, UploadRequest};
use crate::handle::TransferState;
use crate::tracker::PartCompletionTracker;
use crate::{ByteStream, TransferError, TransferResult};

/// Upload a source whose length is only known once it ends.
///
/// One part's worth is buffered first. If the source ends within it, a single
/// put is sent and no session is created. A second chunk commits the upload
/// to multipart; both buffered chunks go out as parts 1 and 2 and the rest
/// streams behind them. The first chunk is not counted against
/// `max_buffered_bytes`, so at most one part more than the budget is held.
/// These uploads cannot be paused.
#[instrument(skip_all, fields(transfer_id = %ctx.transfer_id, bucket = %request.object.bucket, key = %request.object.key))]
pub(super) async fn upload(ctx: UploadContext, request: UploadRequest, body: ByteStream) -> TransferResult<UploadOutput> {
    ctx.control.advance(TransferState::BufferingFirstChunk);

    let part_size = ctx.config.part_size;
    let mut chunks = Box::pin(part_chunks(body, part_size, None, ctx.budget.clone()));

    let Some(mut first) = next_chunk(&ctx, &mut chunks).await? else {
        debug!("source was empty");
        return put_single(&ctx, &request, bytes::Bytes::new()).await;
    };
    // The lookahead chunk is held outside the budget
    drop(first.reservation.take());
    let Some(second) = next_chunk(&ctx, &mut chunks).await? else {
        debug!(bytes = first.body.len(), "source fit in one part");
        return put_single(&ctx, &request, first.body).await;
    };

    ctx.control.advance(TransferState::CreatingSession);
    let upload_id = ctx.create_session(&request).await?;

    let tracker = Arc::new(PartCompletionTracker::new(None));
    let session = UploadSession::new(
        ctx.transport.clone(),
        request.object.clone(),
        upload_id.clone(),
        tracker.clone(),
        ctx.control.token(),
    );
    ctx.control.advance(TransferState::Transferring);
    info!(upload_id = %upload_id, part_size, "uploading parts of unknown-length source");

    let parts = futures_util::stream::iter([Ok::<_, TransferError>(first), Ok(second)]).chain(chunks);
    let operation = Arc::new(UploadPartOp {
        object: request.object.clone(),
    });
    let outcome = session
        .send_parts(operation, parts, ctx.config.max_concurrency, ctx.gauge.clone())
        .await;
    let put = session.conclude(&ctx.control, outcome, None).await?;

    Ok(UploadOutput {
        transfer_id: ctx.transfer_id.clone(),
        object: request.object,
        put,
        upload_id: Some(upload_id),
        parts: tracker.completed_count() as u32,
        bytes: tracker.completed_bytes(),
    })
}

/// Next chunk of the source, or a stop error if the transfer was cancelled while waiting
async fn next_chunk<S>(ctx: &UploadContext, chunks: &mut S) -> TransferResult<Option<PartChunk>>
where
    S: Stream<Item = TransferResult<PartChunk>> + Unpin,
{
    tokio::select! {
        biased;
        _ = ctx.control.token().cancelled() => Err(ctx.stopped()),
        next = chunks.next() => next.transpose(),
    }
}
