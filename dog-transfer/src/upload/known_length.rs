use std::sync::Arc;

use tracing::{info, instrument, warn};

use super::chunker::part_chunks;
use super::multipart::{UploadPartOp, UploadSession};
use super::{put_whole, UploadContext, UploadOutput, UploadRequest};
use crate::handle::{PauseSnapshot, TransferState};
use crate::part_math::{optimal_part_size, part_count};
use crate::token::ResumeState;
use crate::tracker::PartCompletionTracker;
use crate::{ByteStream, CompletedPart, ObjectKey, ResumeToken, SessionId, TransferError, TransferResult};

/// Progress of a known-length upload as seen by `pause()`
struct KnownLengthProgress {
    object: ObjectKey,
    content_length: u64,
    part_size: u64,
    total_parts: u32,
    upload_id: Option<SessionId>,
    tracker: Option<Arc<PartCompletionTracker>>,
}

impl PauseSnapshot for KnownLengthProgress {
    fn resume_token(&self) -> Option<ResumeToken> {
        let parts_completed = self
            .tracker
            .as_ref()
            .map(|tracker| tracker.completed_count() as u32)
            .unwrap_or(0);
        Some(ResumeToken::upload(
            self.object.clone(),
            self.upload_id.clone(),
            self.content_length,
            self.part_size,
            self.total_parts,
            parts_completed,
        ))
    }
}

/// A resumed upload whose session is still being listed
struct PendingResume(ResumeToken);

impl PauseSnapshot for PendingResume {
    fn resume_token(&self) -> Option<ResumeToken> {
        Some(self.0.clone())
    }
}

#[instrument(
    skip_all,
    fields(transfer_id = %ctx.transfer_id, bucket = %request.object.bucket, key = %request.object.key, content_length = content_length)
)]
pub(super) async fn upload(
    ctx: UploadContext,
    request: UploadRequest,
    content_length: u64,
    body: ByteStream,
    resume: Option<ResumeToken>,
) -> TransferResult<UploadOutput> {
    if content_length <= ctx.config.single_request_ceiling() {
        return put_whole(&ctx, &request, body, Some(content_length)).await;
    }

    let part_size = optimal_part_size(content_length, ctx.config.part_size);
    let total_parts = part_count(content_length, part_size);
    let progress = |upload_id: Option<SessionId>, tracker: Option<Arc<PartCompletionTracker>>| {
        Arc::new(KnownLengthProgress {
            object: request.object.clone(),
            content_length,
            part_size,
            total_parts,
            upload_id,
            tracker,
        })
    };
    let resumed = match resume {
        Some(token) => resume_session(&ctx, &request.object, &token, content_length, part_size, total_parts).await?,
        None => None,
    };

    let (upload_id, existing) = match resumed {
        Some(resumed) => resumed,
        None => {
            ctx.control.set_snapshot(progress(None, None));
            ctx.control.advance(TransferState::CreatingSession);
            let upload_id = ctx.create_session(&request).await?;
            (upload_id, Vec::new())
        }
    };

    let tracker = Arc::new(PartCompletionTracker::new(Some(total_parts)).with_existing(existing));
    let session = UploadSession::new(
        ctx.transport.clone(),
        request.object.clone(),
        upload_id.clone(),
        tracker.clone(),
        ctx.control.token(),
    );
    ctx.control
        .set_snapshot(progress(Some(upload_id.clone()), Some(tracker.clone())));
    ctx.control.advance(TransferState::Transferring);

    info!(
        upload_id = %upload_id,
        part_size,
        total_parts,
        pre_existing = tracker.pre_existing_count(),
        "uploading parts"
    );

    let chunks = part_chunks(body, part_size, Some(content_length), ctx.budget.clone());
    let operation = Arc::new(UploadPartOp {
        object: request.object.clone(),
    });
    let outcome = session
        .send_parts(operation, chunks, ctx.config.max_concurrency, ctx.gauge.clone())
        .await;
    let put = session.conclude(&ctx.control, outcome, Some(total_parts)).await?;

    Ok(UploadOutput {
        transfer_id: ctx.transfer_id.clone(),
        object: request.object,
        put,
        upload_id: Some(upload_id),
        parts: total_parts,
        bytes: content_length,
    })
}

/// Pick up the session named by `token`, or None to start over.
///
/// A token that no longer fits the source is not an error: its session is
/// aborted (best effort) and the upload restarts from scratch.
async fn resume_session(
    ctx: &UploadContext,
    object: &ObjectKey,
    token: &ResumeToken,
    content_length: u64,
    part_size: u64,
    total_parts: u32,
) -> TransferResult<Option<(SessionId, Vec<CompletedPart>)>> {
    let Some(upload_id) = token.upload_id().cloned() else {
        info!("resume token was taken before a session existed; starting fresh");
        return Ok(None);
    };

    if let Err(mismatch) = check_token(token, object, content_length, part_size, total_parts) {
        warn!(upload_id = %upload_id, error = %mismatch, "resume token does not fit this upload; starting fresh");
        if let Err(err) = ctx.transport.abort_multipart_upload(&token.object, &upload_id).await {
            warn!(upload_id = %upload_id, error = %err, "failed to abort stale multipart session");
        }
        return Ok(None);
    }

    // Pausing while the session is listed hands back the caller's token
    ctx.control.set_snapshot(Arc::new(PendingResume(token.clone())));
    let listed = tokio::select! {
        biased;
        _ = ctx.control.token().cancelled() => return Err(ctx.stopped()),
        listed = ctx.transport.list_parts(object, &upload_id) => listed?,
    };
    let existing: Vec<CompletedPart> = listed
        .into_iter()
        .filter(|part| (1..=total_parts).contains(&part.part_number))
        .collect();

    info!(
        upload_id = %upload_id,
        listed = existing.len(),
        recorded = token.parts_completed(),
        "resuming multipart session"
    );
    Ok(Some((upload_id, existing)))
}

fn check_token(
    token: &ResumeToken,
    object: &ObjectKey,
    content_length: u64,
    part_size: u64,
    total_parts: u32,
) -> TransferResult<()> {
    if &token.object != object {
        return Err(TransferError::resume_mismatch(token.object.to_string(), object.to_string()));
    }
    if let ResumeState::Upload {
        content_length: recorded,
        ..
    } = &token.state
    {
        if *recorded != content_length {
            return Err(TransferError::resume_mismatch(
                format!("{} bytes", recorded),
                format!("{} bytes", content_length),
            ));
        }
    }
    token.check_layout(part_size, total_parts)
}
