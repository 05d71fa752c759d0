//! # dog-transfer: Multipart transfers for object stores
//!
//! `dog-transfer` moves objects that are too large for a single request by
//! splitting them into parts, keeping a bounded number of part requests in
//! flight, and committing the result exactly once. A transfer either commits
//! or is unwound: failed uploads abort their multipart session.
//!
//! ## Key Features
//!
//! - **Known- and unknown-length uploads**: sized sources are split up front;
//!   streams of unknown length decide between a single put and multipart after
//!   buffering one part
//! - **Three download strategies**: serial, unordered and bounded-parallel,
//!   all pinned to the first response's etag
//! - **Server-side copy**: part-ranged copies for large objects
//! - **Pause and resume**: paused uploads and downloads hand back an opaque
//!   [`ResumeToken`]; resuming skips every part that is already stored
//! - **Backpressure**: part requests are capped by `max_concurrency` and
//!   buffered bytes by `max_buffered_bytes`
//! - **Transport agnostic**: engines talk to an [`ObjectTransport`]; an
//!   [`S3Transport`] over the AWS SDK is included
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dog_transfer::prelude::*;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> TransferResult<()> {
//! let transport = Arc::new(S3Transport::from_env().await);
//! let engine = UploadEngine::new(transport, TransferConfig::default())?;
//!
//! let data = bytes::Bytes::from(vec![0u8; 20 * 1024 * 1024]);
//! let handle = engine.upload(
//!     UploadRequest::new(ObjectKey::new("media", "videos/intro.mp4")),
//!     UploadSource::from_bytes(data),
//! );
//!
//! let output = handle.join().await?;
//! println!("committed {} parts", output.parts);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ UploadEngine  CopyEngine  DownloadEngine │  ← per-transfer tasks and handles
//! ├──────────────────────────────────────────┤
//! │ BoundedForwarder  PartCompletionTracker  │  ← windowing and part bookkeeping
//! │ ByteBudget  part_math  ResumeToken       │
//! ├──────────────────────────────────────────┤
//! │ ObjectTransport (S3Transport, ...)       │  ← requests, signing, retries
//! └──────────────────────────────────────────┘
//! ```
//!
//! The engine never retries a part itself. Every error a transport returns is
//! final for that request and fails the transfer; [`TransferError::is_retryable`]
//! tells callers whether starting again could help.

mod budget;
mod config;
mod copy;
mod download;
mod error;
mod forwarder;
mod handle;
pub mod part_math;
mod s3;
mod token;
mod tracker;
pub mod transport;
mod types;
mod upload;

pub use budget::{BudgetReservation, ByteBudget};
pub use config::{S3Config, TransferConfig, MIB};
pub use copy::{CopyEngine, CopyHandle, CopyOutput, CopyRequest};
pub use download::{
    DownloadEngine, DownloadHandle, DownloadOutput, DownloadRequest, DownloadResumeContext, DownloadStrategy,
    FileSink, MemorySink, PartSink,
};
pub use error::{TransferError, TransferResult};
pub use forwarder::{BoundedForwarder, ForwardSummary, InFlight, Terminal};
pub use handle::TransferState;
pub use s3::S3Transport;
pub use token::{ResumeState, ResumeToken, TOKEN_VERSION};
pub use tracker::PartCompletionTracker;
pub use transport::ObjectTransport;
pub use types::{
    ByteRange, ByteStream, CompletedPart, ObjectKey, ObjectOptions, PartDescriptor, SessionId, TransferId,
};
pub use upload::{UploadEngine, UploadHandle, UploadOutput, UploadRequest, UploadSource};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        CopyEngine, CopyRequest, DownloadEngine, DownloadRequest, DownloadStrategy, MemorySink, ObjectKey,
        ObjectTransport, ResumeToken, S3Transport, TransferConfig, TransferError, TransferResult, UploadEngine,
        UploadRequest, UploadSource,
    };
}
