use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::part_math::MAX_PARTS;
use crate::{CompletedPart, TransferError, TransferResult};

/// Completed parts of one multipart session, indexed by part number.
///
/// Append-only and write-once per part number: completion callbacks from
/// different workers may record concurrently, but an entry is never replaced.
#[derive(Debug, Default)]
pub struct PartCompletionTracker {
    expected_parts: Option<u32>,
    existing: BTreeMap<u32, CompletedPart>,
    completed: Mutex<BTreeMap<u32, CompletedPart>>,
}

impl PartCompletionTracker {
    pub fn new(expected_parts: Option<u32>) -> Self {
        Self {
            expected_parts,
            existing: BTreeMap::new(),
            completed: Mutex::new(BTreeMap::new()),
        }
    }

    /// Seed with parts the store already holds (resumed session)
    pub fn with_existing<I: IntoIterator<Item = CompletedPart>>(mut self, parts: I) -> Self {
        self.existing = parts.into_iter().map(|p| (p.part_number, p)).collect();
        self
    }

    pub fn expected_parts(&self) -> Option<u32> {
        self.expected_parts
    }

    /// True if the part was stored before this run started
    pub fn is_pre_existing(&self, part_number: u32) -> bool {
        self.existing.contains_key(&part_number)
    }

    pub fn pre_existing_count(&self) -> usize {
        self.existing.len()
    }

    /// Record a newly completed part
    pub fn record(&self, part: CompletedPart) -> TransferResult<()> {
        let limit = self.expected_parts.unwrap_or(MAX_PARTS);
        if part.part_number == 0 || part.part_number > limit {
            return Err(TransferError::invariant(format!(
                "part {} is outside 1..={}",
                part.part_number, limit
            )));
        }

        let mut completed = self.completed.lock();
        if completed.contains_key(&part.part_number) {
            return Err(TransferError::invariant(format!(
                "part {} completed twice",
                part.part_number
            )));
        }
        completed.insert(part.part_number, part);
        Ok(())
    }

    /// Parts finished in this run
    pub fn newly_completed_count(&self) -> usize {
        self.completed.lock().len()
    }

    /// Pre-existing plus newly completed part numbers, without double counting
    pub fn completed_count(&self) -> usize {
        let completed = self.completed.lock();
        self.existing.len()
            + completed
                .keys()
                .filter(|n| !self.existing.contains_key(n))
                .count()
    }

    /// Bytes covered by every completed part, pre-existing ones included
    pub fn completed_bytes(&self) -> u64 {
        let completed = self.completed.lock();
        self.existing.values().map(|p| p.size_bytes).sum::<u64>()
            + completed
                .values()
                .filter(|p| !self.existing.contains_key(&p.part_number))
                .map(|p| p.size_bytes)
                .sum::<u64>()
    }

    /// Ordered commit list for parts `1..=count`
    pub fn merged(&self, count: u32) -> TransferResult<Vec<CompletedPart>> {
        let completed = self.completed.lock();
        merge(&self.existing, &completed, count)
    }
}

/// Build the ascending commit list for parts `1..=count`.
///
/// A pre-existing entry wins over a new one for the same position. A position
/// present in neither map means commit was attempted before the part finished.
pub fn merge(
    pre_existing: &BTreeMap<u32, CompletedPart>,
    newly_completed: &BTreeMap<u32, CompletedPart>,
    count: u32,
) -> TransferResult<Vec<CompletedPart>> {
    (1..=count)
        .map(|part_number| {
            pre_existing
                .get(&part_number)
                .or_else(|| newly_completed.get(&part_number))
                .cloned()
                .ok_or_else(|| {
                    TransferError::invariant(format!(
                        "part {} of {} missing at commit",
                        part_number, count
                    ))
                })
        })
        .collect()
}
