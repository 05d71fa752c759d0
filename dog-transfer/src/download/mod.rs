//! Part-numbered multipart downloads.
//!
//! Part 1 is always fetched first and alone: its response carries the
//! object's part count and etag. Every later request is pinned to that etag
//! with `If-Match`, so an object replaced mid-download fails the transfer
//! instead of producing a mix of two versions. The remaining parts are
//! fetched by one of three [`DownloadStrategy`] variants.

mod parallel;
mod resume;
mod serial;
mod sink;
mod unordered;

pub use resume::DownloadResumeContext;
pub use sink::{FileSink, MemorySink, PartSink};

use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::budget::ByteBudget;
use crate::config::TransferConfig;
use crate::forwarder::{InFlight, Terminal};
use crate::handle::{join_task, terminal_state, FinishGuard, PauseSnapshot, TransferControl, TransferState};
use crate::part_math::MAX_PARTS;
use crate::transport::{GetObjectOutput, GetObjectRequest, ObjectTransport};
use crate::{ObjectKey, ResumeToken, TransferError, TransferId, TransferResult};

/// How parts after the first are fetched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStrategy {
    /// One request at a time, written in part order
    Serial,
    /// Requests issued one after another; bodies drain into the sink
    /// concurrently and may finish in any order
    Unordered,
    /// Up to `max_concurrency` requests in flight at once
    #[default]
    Parallel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub object: ObjectKey,
    pub strategy: DownloadStrategy,
}

impl DownloadRequest {
    pub fn new(object: ObjectKey) -> Self {
        Self {
            object,
            strategy: DownloadStrategy::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: DownloadStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// Result of a finished download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutput {
    pub transfer_id: TransferId,
    pub object: ObjectKey,
    pub etag: Option<String>,
    pub parts: u32,
    pub bytes: u64,
}

/// How a strategy's part phase ended when no part failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchOutcome {
    Finished,
    Stopped,
}

/// What part 1 revealed about the object
#[derive(Debug, Clone)]
pub(crate) struct PartLayout {
    /// Pinned with `If-Match` on every later request
    pub etag: Option<String>,
    pub part_size: u64,
    pub total_parts: u32,
}

/// Store the first part failure and stop the remaining parts. Later failures
/// are only logged.
pub(crate) fn fail_part(
    failure: &Terminal<TransferError>,
    cancel: &CancellationToken,
    part_number: u32,
    err: TransferError,
) {
    match failure.complete(err) {
        Ok(()) => {
            warn!(part_number, "part failed; stopping download");
            cancel.cancel();
        }
        Err(later) => debug!(part_number, error = %later, "additional part failure after the first"),
    }
}

/// Re-raise a part task's panic on the download task
pub(crate) fn propagate_panic(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            std::panic::resume_unwind(err.into_panic());
        }
    }
}

/// State shared by a download task and the part tasks it spawns
pub(crate) struct DownloadJob {
    pub transfer_id: TransferId,
    pub transport: Arc<dyn ObjectTransport>,
    pub config: TransferConfig,
    pub object: ObjectKey,
    pub sink: Arc<dyn PartSink>,
    pub control: Arc<TransferControl>,
    pub gauge: InFlight,
    pub budget: ByteBudget,
    pub progress: Arc<Mutex<Option<DownloadResumeContext>>>,
}

struct DownloadProgress(Arc<Mutex<Option<DownloadResumeContext>>>);

impl PauseSnapshot for DownloadProgress {
    fn resume_token(&self) -> Option<ResumeToken> {
        self.0.lock().as_ref().map(DownloadResumeContext::to_token)
    }
}

impl DownloadJob {
    #[instrument(
        skip_all,
        fields(transfer_id = %self.transfer_id, bucket = %self.object.bucket, key = %self.object.key, strategy = ?strategy)
    )]
    async fn run(
        self: Arc<Self>,
        strategy: DownloadStrategy,
        resume: Option<DownloadResumeContext>,
    ) -> TransferResult<DownloadOutput> {
        let context = match resume {
            Some(context) if !context.completed_parts().is_empty() => {
                if context.object() != &self.object {
                    return Err(TransferError::invalid(format!(
                        "resume context belongs to {}, not {}",
                        context.object(),
                        self.object
                    )));
                }
                info!(
                    completed = context.completed_parts().len(),
                    total_parts = context.total_parts(),
                    offset = context.bytes_to_last_contiguous_part(),
                    "resuming download"
                );
                self.sink.seek(context.bytes_to_last_contiguous_part()).await?;
                context
            }
            Some(context) => self.fetch_first(context.etag().map(str::to_string)).await?,
            None => self.fetch_first(None).await?,
        };

        let layout = PartLayout {
            etag: context.etag().map(str::to_string),
            part_size: context.part_size(),
            total_parts: context.total_parts(),
        };
        let remaining = context.remaining_parts();
        *self.progress.lock() = Some(context);
        self.control.set_snapshot(Arc::new(DownloadProgress(self.progress.clone())));
        self.control.advance(TransferState::Transferring);

        debug!(remaining = remaining.len(), total_parts = layout.total_parts, "fetching remaining parts");
        let outcome = match strategy {
            DownloadStrategy::Serial => serial::fetch(&self, remaining, &layout).await,
            DownloadStrategy::Unordered => unordered::fetch(&self, remaining, &layout).await,
            DownloadStrategy::Parallel => parallel::fetch(&self, remaining, &layout).await,
        };

        if self.control.pause_requested() {
            return Err(TransferError::Paused);
        }
        if outcome? == FetchOutcome::Stopped || !self.control.begin_commit() {
            return Err(self.stopped());
        }

        let bytes = {
            let progress = self.progress.lock();
            match progress.as_ref() {
                Some(context) if context.is_finished() => context.bytes_to_last_contiguous_part(),
                _ => {
                    return Err(TransferError::invariant("download ended with parts still missing"));
                }
            }
        };
        self.sink.finish().await?;
        info!(parts = layout.total_parts, bytes, "download complete");

        Ok(DownloadOutput {
            transfer_id: self.transfer_id.clone(),
            object: self.object.clone(),
            etag: layout.etag,
            parts: layout.total_parts,
            bytes,
        })
    }

    /// Fetch part 1 alone and learn the object's layout from it
    async fn fetch_first(&self, if_match: Option<String>) -> TransferResult<DownloadResumeContext> {
        let response = tokio::select! {
            biased;
            _ = self.control.token().cancelled() => return Err(self.stopped()),
            response = self.transport.get_object(GetObjectRequest::part(self.object.clone(), 1).with_if_match(if_match.clone())) => response?,
        };

        // Objects stored in one request report no part count
        let total_parts = response.parts_count.unwrap_or(1).max(1);
        if total_parts > MAX_PARTS {
            return Err(TransferError::invariant(format!(
                "object reports {} parts, more than the protocol allows",
                total_parts
            )));
        }
        let total_length = match response.content_range {
            Some((_, total)) => Some(total),
            None if total_parts == 1 => Some(response.content_length),
            None => None,
        };
        let etag = response.etag.clone().or(if_match);
        let part_size = response.content_length;
        info!(total_parts, part_size, total_length = ?total_length, etag = ?etag, "discovered object layout");

        self.sink.prepare(total_length).await?;
        let mut context = DownloadResumeContext::new(self.object.clone(), etag, total_parts, part_size);

        let written = tokio::select! {
            biased;
            _ = self.control.token().cancelled() => return Err(self.stopped()),
            written = self.write_part(1, response, part_size) => written?,
        };
        context.record(1, written)?;
        Ok(context)
    }

    /// GET one part, stream it into the sink and record it
    pub(crate) async fn transfer_part(&self, part_number: u32, layout: &PartLayout) -> TransferResult<()> {
        let response = self.get_part(part_number, layout).await?;
        let written = self.write_part(part_number, response, layout.part_size).await?;
        self.record(part_number, written)
    }

    pub(crate) async fn get_part(&self, part_number: u32, layout: &PartLayout) -> TransferResult<GetObjectOutput> {
        let request = GetObjectRequest::part(self.object.clone(), part_number).with_if_match(layout.etag.clone());
        let response = self.transport.get_object(request).await?;
        if let Some(count) = response.parts_count {
            if count != layout.total_parts {
                return Err(TransferError::invariant(format!(
                    "part {} reports {} parts, expected {}",
                    part_number, count, layout.total_parts
                )));
            }
        }
        Ok(response)
    }

    /// Stream a response body into the sink at the part's offset
    pub(crate) async fn write_part(
        &self,
        part_number: u32,
        response: GetObjectOutput,
        part_size: u64,
    ) -> TransferResult<u64> {
        let mut offset = match response.content_range {
            Some((range, _)) => range.start,
            None => (part_number as u64 - 1) * part_size,
        };
        let mut body = response.body;
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            let length = chunk.len() as u64;
            self.sink.write_at(offset, chunk).await?;
            offset += length;
            written += length;
        }
        debug!(part_number, bytes = written, "part written");
        Ok(written)
    }

    /// Record a written part in the shared progress
    pub(crate) fn record(&self, part_number: u32, bytes: u64) -> TransferResult<()> {
        let mut progress = self.progress.lock();
        match progress.as_mut() {
            Some(context) => context.record(part_number, bytes),
            None => Err(TransferError::invariant("part finished before the download layout was known")),
        }
    }

    pub(crate) fn stopped(&self) -> TransferError {
        if self.control.pause_requested() {
            TransferError::Paused
        } else {
            TransferError::Cancelled
        }
    }
}

/// Starts downloads against one transport with one configuration
#[derive(Clone)]
pub struct DownloadEngine {
    transport: Arc<dyn ObjectTransport>,
    config: TransferConfig,
}

impl DownloadEngine {
    pub fn new(transport: Arc<dyn ObjectTransport>, config: TransferConfig) -> TransferResult<Self> {
        config.validate()?;
        Ok(Self { transport, config })
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Start a download into `sink` in the background
    pub fn download(&self, request: DownloadRequest, sink: Arc<dyn PartSink>) -> DownloadHandle {
        self.spawn(request, sink, None)
    }

    /// Continue a download, skipping the parts `context` marks complete.
    ///
    /// `sink` must be the destination the interrupted download wrote to.
    pub fn resume_download(
        &self,
        request: DownloadRequest,
        sink: Arc<dyn PartSink>,
        context: DownloadResumeContext,
    ) -> DownloadHandle {
        self.spawn(request, sink, Some(context))
    }

    fn spawn(
        &self,
        request: DownloadRequest,
        sink: Arc<dyn PartSink>,
        resume: Option<DownloadResumeContext>,
    ) -> DownloadHandle {
        let control = TransferControl::new();
        let job = Arc::new(DownloadJob {
            transfer_id: TransferId::new(),
            transport: self.transport.clone(),
            config: self.config.clone(),
            object: request.object,
            sink,
            control: control.clone(),
            gauge: InFlight::default(),
            budget: ByteBudget::new(self.config.max_buffered_bytes),
            progress: Arc::new(Mutex::new(None)),
        });

        let task_job = job.clone();
        let strategy = request.strategy;
        let task = tokio::spawn(async move {
            let control = task_job.control.clone();
            let _guard = FinishGuard::new(control.clone());
            let result = task_job.run(strategy, resume).await;
            control.finish(terminal_state(&result));
            result
        });

        DownloadHandle {
            transfer_id: job.transfer_id.clone(),
            control,
            gauge: job.gauge.clone(),
            progress: job.progress.clone(),
            task,
        }
    }
}

/// A running download
pub struct DownloadHandle {
    transfer_id: TransferId,
    control: Arc<TransferControl>,
    gauge: InFlight,
    progress: Arc<Mutex<Option<DownloadResumeContext>>>,
    task: JoinHandle<TransferResult<DownloadOutput>>,
}

impl DownloadHandle {
    pub fn transfer_id(&self) -> &TransferId {
        &self.transfer_id
    }

    pub fn state(&self) -> TransferState {
        self.control.state()
    }

    /// Part requests currently in flight
    pub fn in_flight(&self) -> usize {
        self.gauge.get()
    }

    /// Progress so far; None until the first part's response arrived.
    /// Usable with [`DownloadEngine::resume_download`] after a failure.
    pub fn resume_context(&self) -> Option<DownloadResumeContext> {
        self.progress.lock().clone()
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Stop the download and return a token for
    /// [`DownloadResumeContext::from_token`]. None before the object's layout
    /// is known, once the download finished, or on a second call.
    pub async fn pause(&self) -> Option<ResumeToken> {
        self.control.pause().await
    }

    pub async fn join(self) -> TransferResult<DownloadOutput> {
        join_task(self.task).await
    }
}

impl std::fmt::Debug for DownloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadHandle")
            .field("transfer_id", &self.transfer_id)
            .field("state", &self.state())
            .finish()
    }
}
