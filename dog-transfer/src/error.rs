use thiserror::Error;

/// Result type for transfer operations
pub type TransferResult<T> = Result<T, TransferError>;

/// Errors that can occur during a multipart transfer
#[derive(Error, Debug)]
pub enum TransferError {
    /// A request to the object store failed after the transport's own retries.
    #[error("Transport error during {operation}: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Internal bookkeeping disagrees with itself. Never retried.
    #[error("Protocol invariant violated: {message}")]
    ProtocolInvariant { message: String },

    #[error("Resume token does not match the source: expected {expected}, found {actual}")]
    ResumeMismatch { expected: String, actual: String },

    #[error("Transfer was cancelled")]
    Cancelled,

    #[error("Transfer was paused")]
    Paused,

    #[error("Invalid request: {message}")]
    Invalid { message: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("Encoding error: {source}")]
    Encoding {
        #[from]
        source: base64::DecodeError,
    },
}

impl TransferError {
    /// Wrap a transport failure, tagged with the operation that failed
    pub fn transport<E>(operation: &'static str, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport {
            operation,
            source: Box::new(error),
        }
    }

    /// Create a protocol invariant error
    pub fn invariant<S: Into<String>>(message: S) -> Self {
        Self::ProtocolInvariant {
            message: message.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a resume mismatch error
    pub fn resume_mismatch<E: Into<String>, A: Into<String>>(expected: E, actual: A) -> Self {
        Self::ResumeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Whether a caller could reasonably retry the whole transfer.
    ///
    /// The engine itself never retries; per-request retries belong to the transport.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Io { .. })
    }

    /// True for caller-initiated stops (cancel or pause)
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Paused)
    }
}
