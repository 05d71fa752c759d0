use serde::{Deserialize, Serialize};

use crate::{TransferError, TransferResult};

pub const MIB: u64 = 1024 * 1024;

/// Configuration for multipart transfers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Target part size (bytes). Grown automatically when the object would
    /// otherwise need more than the protocol's part ceiling.
    pub part_size: u64,

    /// Objects at or below max(threshold, part_size) go up as a single request
    pub multipart_threshold: u64,

    /// Upper bound on part requests in flight at once
    pub max_concurrency: usize,

    /// Upper bound on part bytes held in memory before they reach the store or sink
    pub max_buffered_bytes: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            part_size: 8 * MIB,
            multipart_threshold: 8 * MIB,
            max_concurrency: 8,
            max_buffered_bytes: 64 * MIB,
        }
    }
}

impl TransferConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set part size
    pub fn with_part_size(mut self, bytes: u64) -> Self {
        self.part_size = bytes;
        self
    }

    /// Set multipart threshold
    pub fn with_multipart_threshold(mut self, bytes: u64) -> Self {
        self.multipart_threshold = bytes;
        self
    }

    /// Set the in-flight part limit
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Set the buffered-bytes ceiling
    pub fn with_max_buffered_bytes(mut self, bytes: u64) -> Self {
        self.max_buffered_bytes = bytes;
        self
    }

    /// Size at or below which a known-length object skips multipart entirely
    pub fn single_request_ceiling(&self) -> u64 {
        self.multipart_threshold.max(self.part_size)
    }

    /// Reject configurations the engines cannot honour
    pub fn validate(&self) -> TransferResult<()> {
        if self.part_size == 0 {
            return Err(TransferError::invalid("part_size must be greater than zero"));
        }
        if self.max_concurrency == 0 {
            return Err(TransferError::invalid("max_concurrency must be greater than zero"));
        }
        if self.max_buffered_bytes < self.part_size {
            return Err(TransferError::invalid(format!(
                "max_buffered_bytes ({}) must hold at least one part ({})",
                self.max_buffered_bytes, self.part_size
            )));
        }
        Ok(())
    }
}

/// Connection settings for the S3 transport
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub region: Option<String>,

    /// Custom endpoint for S3-compatible stores (MinIO, R2, ...)
    pub endpoint: Option<String>,

    pub force_path_style: bool,

    pub access_key_id: Option<String>,

    #[serde(skip_serializing)]
    pub secret_access_key: Option<String>,
}

impl S3Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read settings from the environment.
    ///
    /// Credentials left unset fall through to the default AWS provider chain.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        Self {
            region: var("S3_REGION").or_else(|| var("AWS_REGION")),
            endpoint: var("S3_ENDPOINT"),
            force_path_style: var("S3_FORCE_PATH_STYLE")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            access_key_id: var("AWS_ACCESS_KEY_ID"),
            secret_access_key: var("AWS_SECRET_ACCESS_KEY"),
        }
    }

    pub fn with_region<S: Into<String>>(mut self, region: S) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_path_style(mut self) -> Self {
        self.force_path_style = true;
        self
    }

    pub fn with_credentials<A: Into<String>, S: Into<String>>(mut self, access_key_id: A, secret: S) -> Self {
        self.access_key_id = Some(access_key_id.into());
        self.secret_access_key = Some(secret.into());
        self
    }
}
