//! Multipart uploads from a byte stream.
//!
//! Sources with a declared length are split with [`crate::part_math`] and can
//! be paused and resumed. Sources of unknown length decide between a single
//! put and a multipart session after buffering their first part.

mod chunker;
mod known_length;
pub(crate) mod multipart;
mod unknown_length;

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::budget::ByteBudget;
use crate::config::TransferConfig;
use crate::forwarder::InFlight;
use crate::handle::{join_task, terminal_state, FinishGuard, TransferControl, TransferState};
use crate::token::ResumeState;
use crate::transport::{ObjectTransport, PutOutput};
use crate::{ByteStream, ObjectKey, ObjectOptions, ResumeToken, SessionId, TransferError, TransferId, TransferResult};

/// Destination and options for an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub object: ObjectKey,
    pub options: ObjectOptions,
}

impl UploadRequest {
    pub fn new(object: ObjectKey) -> Self {
        Self {
            object,
            options: ObjectOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ObjectOptions) -> Self {
        self.options = options;
        self
    }
}

/// Where upload bytes come from
pub enum UploadSource {
    /// The stream must produce exactly `length` bytes
    Known { length: u64, body: ByteStream },
    Unknown { body: ByteStream },
}

impl UploadSource {
    pub fn known(length: u64, body: ByteStream) -> Self {
        Self::Known { length, body }
    }

    pub fn unknown(body: ByteStream) -> Self {
        Self::Unknown { body }
    }

    /// A known-length source over an in-memory buffer
    pub fn from_bytes(data: Bytes) -> Self {
        let length = data.len() as u64;
        let body: ByteStream = Box::pin(futures_util::stream::once(async move { Ok(data) }));
        Self::Known { length, body }
    }

    pub fn content_length(&self) -> Option<u64> {
        match self {
            Self::Known { length, .. } => Some(*length),
            Self::Unknown { .. } => None,
        }
    }
}

impl std::fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Known { length, .. } => f.debug_struct("Known").field("length", length).finish_non_exhaustive(),
            Self::Unknown { .. } => f.debug_struct("Unknown").finish_non_exhaustive(),
        }
    }
}

/// Result of a finished upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutput {
    pub transfer_id: TransferId,
    pub object: ObjectKey,
    pub put: PutOutput,
    /// Session the object was committed through; None for single puts
    pub upload_id: Option<SessionId>,
    /// Parts committed; zero for single puts
    pub parts: u32,
    pub bytes: u64,
}

/// Everything a running upload task needs
pub(crate) struct UploadContext {
    pub transfer_id: TransferId,
    pub transport: Arc<dyn ObjectTransport>,
    pub config: TransferConfig,
    pub budget: ByteBudget,
    pub control: Arc<TransferControl>,
    pub gauge: InFlight,
}

impl UploadContext {
    /// Error to stop with once the control token fired
    pub fn stopped(&self) -> TransferError {
        if self.control.pause_requested() {
            TransferError::Paused
        } else {
            TransferError::Cancelled
        }
    }

    pub async fn create_session(&self, request: &UploadRequest) -> TransferResult<SessionId> {
        let upload_id = tokio::select! {
            biased;
            _ = self.control.token().cancelled() => return Err(self.stopped()),
            created = self.transport.create_multipart_upload(&request.object, &request.options) => created?,
        };
        info!(upload_id = %upload_id, "created multipart session");
        Ok(upload_id)
    }
}

/// Read a whole known-length source and send it as one put
pub(crate) async fn put_whole(
    ctx: &UploadContext,
    request: &UploadRequest,
    body: ByteStream,
    expected_length: Option<u64>,
) -> TransferResult<UploadOutput> {
    let reservation = ctx.budget.reserve(expected_length.unwrap_or(0)).await?;
    let data = tokio::select! {
        biased;
        _ = ctx.control.token().cancelled() => return Err(ctx.stopped()),
        data = collect_body(body, expected_length) => data?,
    };
    let output = put_single(ctx, request, data).await;
    drop(reservation);
    output
}

/// Send an already-buffered body as one put
pub(crate) async fn put_single(ctx: &UploadContext, request: &UploadRequest, data: Bytes) -> TransferResult<UploadOutput> {
    ctx.control.advance(TransferState::Transferring);
    let bytes = data.len() as u64;
    debug!(bytes, "sending object in a single request");

    let put = tokio::select! {
        biased;
        _ = ctx.control.token().cancelled() => return Err(ctx.stopped()),
        put = ctx.transport.put_object(&request.object, &request.options, data) => put?,
    };

    Ok(UploadOutput {
        transfer_id: ctx.transfer_id.clone(),
        object: request.object.clone(),
        put,
        upload_id: None,
        parts: 0,
        bytes,
    })
}

async fn collect_body(mut body: ByteStream, expected_length: Option<u64>) -> TransferResult<Bytes> {
    let mut buffer = BytesMut::with_capacity(expected_length.unwrap_or(0) as usize);
    while let Some(next) = body.next().await {
        buffer.extend_from_slice(&next?);
        if let Some(expected) = expected_length {
            if buffer.len() as u64 > expected {
                return Err(TransferError::invalid(format!(
                    "source produced more than the declared {} bytes",
                    expected
                )));
            }
        }
    }
    if let Some(expected) = expected_length {
        if buffer.len() as u64 != expected {
            return Err(TransferError::invalid(format!(
                "source produced {} bytes, expected {}",
                buffer.len(),
                expected
            )));
        }
    }
    Ok(buffer.freeze())
}

/// Starts uploads against one transport with one configuration
#[derive(Clone)]
pub struct UploadEngine {
    transport: Arc<dyn ObjectTransport>,
    config: TransferConfig,
}

impl UploadEngine {
    pub fn new(transport: Arc<dyn ObjectTransport>, config: TransferConfig) -> TransferResult<Self> {
        config.validate()?;
        Ok(Self { transport, config })
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Start an upload in the background
    pub fn upload(&self, request: UploadRequest, source: UploadSource) -> UploadHandle {
        self.spawn(request, source, None)
    }

    /// Continue a paused upload from its token.
    ///
    /// The source must produce the same bytes as the original. If the token
    /// no longer fits the source (different length or part layout) the
    /// upload starts again from the first part.
    pub fn resume_upload(
        &self,
        token: ResumeToken,
        request: UploadRequest,
        source: UploadSource,
    ) -> TransferResult<UploadHandle> {
        if !matches!(token.state, ResumeState::Upload { .. }) {
            return Err(TransferError::invalid("resume token does not describe an upload"));
        }
        if source.content_length().is_none() {
            return Err(TransferError::invalid("only known-length uploads can be resumed"));
        }
        Ok(self.spawn(request, source, Some(token)))
    }

    fn spawn(&self, request: UploadRequest, source: UploadSource, resume: Option<ResumeToken>) -> UploadHandle {
        let control = TransferControl::new();
        let ctx = UploadContext {
            transfer_id: TransferId::new(),
            transport: self.transport.clone(),
            config: self.config.clone(),
            budget: ByteBudget::new(self.config.max_buffered_bytes),
            control: control.clone(),
            gauge: InFlight::default(),
        };
        let transfer_id = ctx.transfer_id.clone();
        let gauge = ctx.gauge.clone();

        let task = tokio::spawn(async move {
            let control = ctx.control.clone();
            let _guard = FinishGuard::new(control.clone());
            let result = match source {
                UploadSource::Known { length, body } => known_length::upload(ctx, request, length, body, resume).await,
                UploadSource::Unknown { body } => unknown_length::upload(ctx, request, body).await,
            };
            control.finish(terminal_state(&result));
            result
        });

        UploadHandle {
            transfer_id,
            control,
            gauge,
            task,
        }
    }
}

/// A running upload
pub struct UploadHandle {
    transfer_id: TransferId,
    control: Arc<TransferControl>,
    gauge: InFlight,
    task: JoinHandle<TransferResult<UploadOutput>>,
}

impl UploadHandle {
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

    /// Stop the upload. A multipart session that was already created is aborted.
    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Stop the upload and keep its session for [`UploadEngine::resume_upload`].
    ///
    /// Returns None, and leaves the upload running, for uploads that cannot be
    /// paused: single puts and unknown-length sources. Also None once the
    /// upload is committing or finished, or when called a second time.
    pub async fn pause(&self) -> Option<ResumeToken> {
        self.control.pause().await
    }

    /// Wait for the upload to finish
    pub async fn join(self) -> TransferResult<UploadOutput> {
        join_task(self.task).await
    }
}

impl std::fmt::Debug for UploadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadHandle")
            .field("transfer_id", &self.transfer_id)
            .field("state", &self.state())
            .finish()
    }
}
