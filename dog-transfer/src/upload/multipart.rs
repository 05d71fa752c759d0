//! Session bookkeeping shared by uploads and copies: dispatch parts through the
//! bounded forwarder, commit in part order, abort on failure.

use std::sync::Arc;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::chunker::PartChunk;
use crate::forwarder::{BoundedForwarder, InFlight, Terminal};
use crate::handle::TransferControl;
use crate::tracker::PartCompletionTracker;
use crate::transport::{ObjectTransport, PutOutput, UploadPartRequest};
use crate::{CompletedPart, ObjectKey, SessionId, TransferError, TransferResult};

/// Turns one unit of work into a part request and its response into a
/// commit proof. Uploads and copies differ only here.
#[async_trait]
pub(crate) trait PartOperation: Send + Sync + 'static {
    type Input: Send + 'static;

    /// Operation name used in errors and logs
    const NAME: &'static str;

    fn part_number(input: &Self::Input) -> u32;

    async fn send(
        &self,
        transport: &dyn ObjectTransport,
        upload_id: &SessionId,
        input: Self::Input,
    ) -> TransferResult<CompletedPart>;
}

/// Sends buffered chunks with upload-part
pub(crate) struct UploadPartOp {
    pub object: ObjectKey,
}

#[async_trait]
impl PartOperation for UploadPartOp {
    type Input = PartChunk;

    const NAME: &'static str = "upload_part";

    fn part_number(input: &PartChunk) -> u32 {
        input.part_number
    }

    async fn send(
        &self,
        transport: &dyn ObjectTransport,
        upload_id: &SessionId,
        input: PartChunk,
    ) -> TransferResult<CompletedPart> {
        let PartChunk {
            part_number,
            body,
            reservation,
        } = input;
        let size = body.len() as u64;

        let part = transport
            .upload_part(UploadPartRequest {
                object: self.object.clone(),
                upload_id: upload_id.clone(),
                part_number,
                body,
            })
            .await?;
        drop(reservation);

        proof_for(part_number, size, part)
    }
}

/// Check a transport's commit proof belongs to the part that was sent
pub(crate) fn proof_for(part_number: u32, size: u64, mut part: CompletedPart) -> TransferResult<CompletedPart> {
    if part.part_number != part_number {
        return Err(TransferError::invariant(format!(
            "transport answered part {} with a proof for part {}",
            part_number, part.part_number
        )));
    }
    if part.size_bytes == 0 {
        part.size_bytes = size;
    }
    Ok(part)
}

/// A live multipart session on the remote store
pub(crate) struct UploadSession {
    pub transport: Arc<dyn ObjectTransport>,
    pub object: ObjectKey,
    pub upload_id: SessionId,
    pub tracker: Arc<PartCompletionTracker>,
    failure: Arc<Terminal<TransferError>>,
    /// Child of the transfer's token; cancelled by the first part failure
    cancel: CancellationToken,
}

/// How the part phase ended when no part failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PartsOutcome {
    /// Upstream exhausted and every dispatched part stored
    Finished { dispatched: usize },
    /// Stopped from outside (pause or cancel) before finishing
    Stopped,
}

impl UploadSession {
    pub fn new(
        transport: Arc<dyn ObjectTransport>,
        object: ObjectKey,
        upload_id: SessionId,
        tracker: Arc<PartCompletionTracker>,
        transfer_token: &CancellationToken,
    ) -> Self {
        Self {
            transport,
            object,
            upload_id,
            tracker,
            failure: Arc::new(Terminal::new()),
            cancel: transfer_token.child_token(),
        }
    }

    /// Dispatch every input not already stored, at most `max_concurrency` at a time
    pub async fn send_parts<P, S>(
        &self,
        operation: Arc<P>,
        parts: S,
        max_concurrency: usize,
        gauge: InFlight,
    ) -> TransferResult<PartsOutcome>
    where
        P: PartOperation,
        S: Stream<Item = TransferResult<P::Input>>,
    {
        let tracker = self.tracker.clone();
        let pending = parts.filter(move |item| {
            let skip = match item {
                Ok(input) => tracker.is_pre_existing(P::part_number(input)),
                Err(_) => false,
            };
            futures_util::future::ready(!skip)
        });

        let forwarder = BoundedForwarder::new(max_concurrency, self.cancel.clone()).with_gauge(gauge);
        let run = forwarder
            .run(pending, |input: P::Input| {
                let operation = operation.clone();
                let transport = self.transport.clone();
                let upload_id = self.upload_id.clone();
                let tracker = self.tracker.clone();
                let failure = self.failure.clone();
                let cancel = self.cancel.clone();

                async move {
                    let part_number = P::part_number(&input);
                    let recorded = operation
                        .send(transport.as_ref(), &upload_id, input)
                        .await
                        .and_then(|part| tracker.record(part));

                    match recorded {
                        Ok(()) => debug!(part_number, operation = P::NAME, "part stored"),
                        Err(err) => match failure.complete(err) {
                            Ok(()) => {
                                warn!(part_number, operation = P::NAME, "part failed; stopping session");
                                cancel.cancel();
                            }
                            Err(later) => {
                                debug!(part_number, error = %later, "additional part failure after the first")
                            }
                        },
                    }
                }
            })
            .await;

        if let Some(err) = self.failure.take() {
            return Err(err);
        }

        match run {
            Err(err) => Err(err),
            Ok(summary) if summary.cancelled => Ok(PartsOutcome::Stopped),
            Ok(summary) => Ok(PartsOutcome::Finished {
                dispatched: summary.dispatched,
            }),
        }
    }

    /// Turn the outcome of the part phase into the transfer's result: commit
    /// when every part is in, abort on failure or cancel, and leave the
    /// session open when the transfer was paused.
    ///
    /// `total_parts` is None when the count is only known once the source is
    /// exhausted, in which case the dispatched count is used.
    pub async fn conclude(
        &self,
        control: &TransferControl,
        outcome: TransferResult<PartsOutcome>,
        total_parts: Option<u32>,
    ) -> TransferResult<PutOutput> {
        if control.pause_requested() {
            info!(upload_id = %self.upload_id, "session paused; left open for resume");
            return Err(TransferError::Paused);
        }

        let dispatched = match outcome {
            Ok(PartsOutcome::Finished { dispatched }) => dispatched,
            Ok(PartsOutcome::Stopped) => return self.fail(TransferError::Cancelled).await,
            Err(err) => return self.fail(err).await,
        };

        if !control.begin_commit() {
            if control.pause_requested() {
                return Err(TransferError::Paused);
            }
            return self.fail(TransferError::Cancelled).await;
        }

        let total = total_parts.unwrap_or(dispatched as u32);
        match self.commit(total).await {
            Ok(output) => Ok(output),
            Err(err) => self.fail(err).await,
        }
    }

    async fn fail<T>(&self, err: TransferError) -> TransferResult<T> {
        self.abort_quietly(&err).await;
        Err(err)
    }

    /// Commit parts `1..=total_parts` in ascending order
    pub async fn commit(&self, total_parts: u32) -> TransferResult<PutOutput> {
        let parts = self.tracker.merged(total_parts)?;
        info!(upload_id = %self.upload_id, parts = parts.len(), "completing multipart session");
        self.transport
            .complete_multipart_upload(&self.object, &self.upload_id, parts)
            .await
    }

    /// Abort the session. Cleanup is advisory: failures are logged only.
    pub async fn abort_quietly(&self, cause: &TransferError) {
        info!(upload_id = %self.upload_id, cause = %cause, "aborting multipart session");
        if let Err(err) = self
            .transport
            .abort_multipart_upload(&self.object, &self.upload_id)
            .await
        {
            warn!(upload_id = %self.upload_id, error = %err, "failed to abort multipart session");
        }
    }
}
