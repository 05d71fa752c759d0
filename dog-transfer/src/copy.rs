//! Server-side copy, multipart for objects above the single-request ceiling.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::config::TransferConfig;
use crate::forwarder::InFlight;
use crate::handle::{join_task, terminal_state, FinishGuard, TransferControl, TransferState};
use crate::part_math::{describe_parts, optimal_part_size, part_count};
use crate::tracker::PartCompletionTracker;
use crate::transport::{ObjectTransport, PutOutput, UploadPartCopyRequest};
use crate::upload::multipart::{proof_for, PartOperation, UploadSession};
use crate::{
    CompletedPart, ObjectKey, ObjectOptions, PartDescriptor, SessionId, TransferError, TransferId, TransferResult,
};

/// Source, destination and options for a copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRequest {
    pub source: ObjectKey,
    pub destination: ObjectKey,
    /// Applied to the destination when it is copied in parts. Defaults to the
    /// source's content type.
    pub options: ObjectOptions,
}

impl CopyRequest {
    pub fn new(source: ObjectKey, destination: ObjectKey) -> Self {
        Self {
            source,
            destination,
            options: ObjectOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ObjectOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutput {
    pub transfer_id: TransferId,
    pub destination: ObjectKey,
    pub put: PutOutput,
    /// None when the object was copied in one request
    pub upload_id: Option<SessionId>,
    pub parts: u32,
    pub bytes: u64,
}

/// Copies one source byte range into one destination part
struct CopyPartOp {
    source: ObjectKey,
    destination: ObjectKey,
    source_etag: Option<String>,
}

#[async_trait]
impl PartOperation for CopyPartOp {
    type Input = PartDescriptor;

    const NAME: &'static str = "upload_part_copy";

    fn part_number(input: &PartDescriptor) -> u32 {
        input.part_number
    }

    async fn send(
        &self,
        transport: &dyn ObjectTransport,
        upload_id: &SessionId,
        input: PartDescriptor,
    ) -> TransferResult<CompletedPart> {
        let range = input
            .range
            .ok_or_else(|| TransferError::invariant(format!("copy part {} has no source range", input.part_number)))?;

        let part = transport
            .upload_part_copy(UploadPartCopyRequest {
                source: self.source.clone(),
                destination: self.destination.clone(),
                upload_id: upload_id.clone(),
                part_number: input.part_number,
                range,
                source_if_match: self.source_etag.clone(),
            })
            .await?;

        proof_for(input.part_number, input.length, part)
    }
}

/// Starts server-side copies
#[derive(Clone)]
pub struct CopyEngine {
    transport: Arc<dyn ObjectTransport>,
    config: TransferConfig,
}

impl CopyEngine {
    pub fn new(transport: Arc<dyn ObjectTransport>, config: TransferConfig) -> TransferResult<Self> {
        config.validate()?;
        Ok(Self { transport, config })
    }

    /// Start a copy in the background
    pub fn copy(&self, request: CopyRequest) -> CopyHandle {
        let control = TransferControl::new();
        let transfer_id = TransferId::new();
        let gauge = InFlight::default();

        let job = CopyJob {
            transfer_id: transfer_id.clone(),
            transport: self.transport.clone(),
            config: self.config.clone(),
            control: control.clone(),
            gauge: gauge.clone(),
        };
        let task = tokio::spawn(async move {
            let control = job.control.clone();
            let _guard = FinishGuard::new(control.clone());
            let result = job.run(request).await;
            control.finish(terminal_state(&result));
            result
        });

        CopyHandle {
            transfer_id,
            control,
            gauge,
            task,
        }
    }
}

struct CopyJob {
    transfer_id: TransferId,
    transport: Arc<dyn ObjectTransport>,
    config: TransferConfig,
    control: Arc<TransferControl>,
    gauge: InFlight,
}

impl CopyJob {
    #[instrument(
        skip_all,
        fields(transfer_id = %self.transfer_id, source = %request.source, destination = %request.destination)
    )]
    async fn run(self, request: CopyRequest) -> TransferResult<CopyOutput> {
        let token = self.control.token().clone();

        let head = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(TransferError::Cancelled),
            head = self.transport.head_object(&request.source) => head?,
        };

        if head.size_bytes <= self.config.single_request_ceiling() {
            self.control.advance(TransferState::Transferring);
            let put = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(TransferError::Cancelled),
                put = self.transport.copy_object(&request.source, &request.destination) => put?,
            };
            return Ok(CopyOutput {
                transfer_id: self.transfer_id,
                destination: request.destination,
                put,
                upload_id: None,
                parts: 0,
                bytes: head.size_bytes,
            });
        }

        let part_size = optimal_part_size(head.size_bytes, self.config.part_size);
        let total_parts = part_count(head.size_bytes, part_size);

        let mut options = request.options.clone();
        if options.content_type.is_none() {
            options.content_type = head.content_type.clone();
        }

        self.control.advance(TransferState::CreatingSession);
        let upload_id = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(TransferError::Cancelled),
            created = self.transport.create_multipart_upload(&request.destination, &options) => created?,
        };
        info!(upload_id = %upload_id, size = head.size_bytes, part_size, total_parts, "copying in parts");

        let tracker = Arc::new(PartCompletionTracker::new(Some(total_parts)));
        let session = UploadSession::new(
            self.transport.clone(),
            request.destination.clone(),
            upload_id.clone(),
            tracker,
            &token,
        );
        self.control.advance(TransferState::Transferring);

        let operation = Arc::new(CopyPartOp {
            source: request.source.clone(),
            destination: request.destination.clone(),
            source_etag: head.etag.clone(),
        });
        let parts = describe_parts(head.size_bytes, part_size)
            .into_iter()
            .map(Ok::<_, TransferError>);
        let parts = futures_util::stream::iter(parts);
        let outcome = session
            .send_parts(operation, parts, self.config.max_concurrency, self.gauge.clone())
            .await;
        let put = session.conclude(&self.control, outcome, Some(total_parts)).await?;

        Ok(CopyOutput {
            transfer_id: self.transfer_id,
            destination: request.destination,
            put,
            upload_id: Some(upload_id),
            parts: total_parts,
            bytes: head.size_bytes,
        })
    }
}

/// A running copy
pub struct CopyHandle {
    transfer_id: TransferId,
    control: Arc<TransferControl>,
    gauge: InFlight,
    task: JoinHandle<TransferResult<CopyOutput>>,
}

impl CopyHandle {
    pub fn transfer_id(&self) -> &TransferId {
        &self.transfer_id
    }

    pub fn state(&self) -> TransferState {
        self.control.state()
    }

    pub fn in_flight(&self) -> usize {
        self.gauge.get()
    }

    /// Stop the copy and abort its session if one was created
    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub async fn join(self) -> TransferResult<CopyOutput> {
        join_task(self.task).await
    }
}
