use std::collections::{BTreeMap, BTreeSet};

use crate::token::ResumeState;
use crate::{ObjectKey, ResumeToken, TransferError, TransferResult};

/// Which parts of a download are already in the sink.
///
/// Tracks the completed set, the highest part `k` such that `1..=k` are all
/// complete, and the byte offset just past part `k`. A resumed download
/// skips every completed part and seeks its sink to that offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResumeContext {
    object: ObjectKey,
    etag: Option<String>,
    total_parts: u32,
    part_size: u64,
    completed: BTreeSet<u32>,
    contiguous: u32,
    contiguous_bytes: u64,
    // Lengths of completed parts beyond the contiguous prefix
    pending_lengths: BTreeMap<u32, u64>,
}

impl DownloadResumeContext {
    pub fn new(object: ObjectKey, etag: Option<String>, total_parts: u32, part_size: u64) -> Self {
        Self {
            object,
            etag,
            total_parts,
            part_size,
            completed: BTreeSet::new(),
            contiguous: 0,
            contiguous_bytes: 0,
            pending_lengths: BTreeMap::new(),
        }
    }

    /// Rebuild from a token returned by a paused download
    pub fn from_token(token: &ResumeToken) -> TransferResult<Self> {
        let ResumeState::Download {
            etag,
            completed_parts,
            bytes_to_last_contiguous_part,
            pending_lengths,
        } = &token.state
        else {
            return Err(TransferError::invalid("resume token does not describe a download"));
        };

        if let Some(out_of_range) = completed_parts
            .iter()
            .find(|n| **n == 0 || **n > token.total_parts)
        {
            return Err(TransferError::invalid(format!(
                "resume token lists part {} of a {}-part object",
                out_of_range, token.total_parts
            )));
        }

        let mut context = Self::new(token.object.clone(), etag.clone(), token.total_parts, token.part_size);
        context.completed = completed_parts.clone();
        while context.completed.contains(&(context.contiguous + 1)) {
            context.contiguous += 1;
        }
        context.contiguous_bytes = *bytes_to_last_contiguous_part;
        context.pending_lengths = context
            .completed
            .iter()
            .filter(|n| **n > context.contiguous)
            .map(|n| (*n, pending_lengths.get(n).copied().unwrap_or(token.part_size)))
            .collect();
        Ok(context)
    }

    pub fn to_token(&self) -> ResumeToken {
        ResumeToken::download(
            self.object.clone(),
            self.etag.clone(),
            self.part_size,
            self.total_parts,
            self.completed.clone(),
            self.contiguous_bytes,
            self.pending_lengths.clone(),
        )
    }

    /// Mark `part_number` written, `bytes` long
    pub fn record(&mut self, part_number: u32, bytes: u64) -> TransferResult<()> {
        if part_number == 0 || part_number > self.total_parts {
            return Err(TransferError::invariant(format!(
                "part {} completed for a {}-part object",
                part_number, self.total_parts
            )));
        }
        if !self.completed.insert(part_number) {
            return Err(TransferError::invariant(format!(
                "part {} completed twice",
                part_number
            )));
        }

        self.pending_lengths.insert(part_number, bytes);
        while let Some(length) = self.pending_lengths.remove(&(self.contiguous + 1)) {
            self.contiguous += 1;
            self.contiguous_bytes += length;
        }
        Ok(())
    }

    pub fn object(&self) -> &ObjectKey {
        &self.object
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn total_parts(&self) -> u32 {
        self.total_parts
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn is_completed(&self, part_number: u32) -> bool {
        self.completed.contains(&part_number)
    }

    pub fn completed_parts(&self) -> &BTreeSet<u32> {
        &self.completed
    }

    /// Largest `k` with parts `1..=k` all complete; zero if part 1 is missing
    pub fn highest_contiguous(&self) -> u32 {
        self.contiguous
    }

    /// Byte offset just past the highest contiguous part
    pub fn bytes_to_last_contiguous_part(&self) -> u64 {
        self.contiguous_bytes
    }

    /// Parts still to fetch, ascending
    pub fn remaining_parts(&self) -> Vec<u32> {
        (self.contiguous + 1..=self.total_parts)
            .filter(|n| !self.completed.contains(n))
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        self.contiguous == self.total_parts
    }
}
