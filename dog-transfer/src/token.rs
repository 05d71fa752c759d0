use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::{ObjectKey, SessionId, TransferError, TransferResult};

/// Current token encoding version
pub const TOKEN_VERSION: u32 = 1;

/// Snapshot of a paused transfer. Callers treat it as an opaque blob
/// (see [`ResumeToken::encode`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken {
    pub version: u32,
    pub object: ObjectKey,
    pub part_size: u64,
    pub total_parts: u32,
    pub created_at: DateTime<Utc>,
    pub state: ResumeState,
}

/// Transfer-kind specific progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResumeState {
    Upload {
        /// None when paused before the session was created
        upload_id: Option<SessionId>,
        content_length: u64,
        parts_completed: u32,
    },
    Download {
        etag: Option<String>,
        completed_parts: BTreeSet<u32>,
        bytes_to_last_contiguous_part: u64,
        /// Written length of each completed part past the contiguous prefix
        #[serde(default)]
        pending_lengths: BTreeMap<u32, u64>,
    },
}

impl ResumeToken {
    pub fn upload(
        object: ObjectKey,
        upload_id: Option<SessionId>,
        content_length: u64,
        part_size: u64,
        total_parts: u32,
        parts_completed: u32,
    ) -> Self {
        Self {
            version: TOKEN_VERSION,
            object,
            part_size,
            total_parts,
            created_at: Utc::now(),
            state: ResumeState::Upload {
                upload_id,
                content_length,
                parts_completed,
            },
        }
    }

    pub fn download(
        object: ObjectKey,
        etag: Option<String>,
        part_size: u64,
        total_parts: u32,
        completed_parts: BTreeSet<u32>,
        bytes_to_last_contiguous_part: u64,
        pending_lengths: BTreeMap<u32, u64>,
    ) -> Self {
        Self {
            version: TOKEN_VERSION,
            object,
            part_size,
            total_parts,
            created_at: Utc::now(),
            state: ResumeState::Download {
                etag,
                completed_parts,
                bytes_to_last_contiguous_part,
                pending_lengths,
            },
        }
    }

    /// Upload id carried by an upload token
    pub fn upload_id(&self) -> Option<&SessionId> {
        match &self.state {
            ResumeState::Upload { upload_id, .. } => upload_id.as_ref(),
            ResumeState::Download { .. } => None,
        }
    }

    /// Completed part count (upload) or completed set size (download)
    pub fn parts_completed(&self) -> u32 {
        match &self.state {
            ResumeState::Upload { parts_completed, .. } => *parts_completed,
            ResumeState::Download { completed_parts, .. } => completed_parts.len() as u32,
        }
    }

    /// Confirm the token describes the same part layout freshly computed for the source
    pub fn check_layout(&self, part_size: u64, total_parts: u32) -> TransferResult<()> {
        if self.part_size != part_size || self.total_parts != total_parts {
            return Err(TransferError::resume_mismatch(
                format!("{} parts of {} bytes", self.total_parts, self.part_size),
                format!("{} parts of {} bytes", total_parts, part_size),
            ));
        }
        Ok(())
    }

    /// Encode as an opaque, URL-safe string
    pub fn encode(&self) -> TransferResult<String> {
        let json = serde_json::to_vec(self)?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Decode a string produced by [`ResumeToken::encode`]
    pub fn decode(encoded: &str) -> TransferResult<Self> {
        let json = URL_SAFE_NO_PAD.decode(encoded.trim())?;
        let token: Self = serde_json::from_slice(&json)?;
        if token.version != TOKEN_VERSION {
            return Err(TransferError::invalid(format!(
                "unsupported resume token version {}",
                token.version
            )));
        }
        Ok(token)
    }
}
