//! Part sizing for multipart transfers.
//!
//! The remote protocol caps a multipart session at [`MAX_PARTS`] parts. When the
//! configured part size would need more parts than that, the part size grows
//! instead of the request failing.

use crate::{ByteRange, PartDescriptor};

/// Protocol ceiling on part numbers
pub const MAX_PARTS: u32 = 10_000;

/// Part size to use for an object of `total_length` bytes
pub fn optimal_part_size(total_length: u64, configured_part_size: u64) -> u64 {
    configured_part_size
        .max(total_length.div_ceil(MAX_PARTS as u64))
        .max(1)
}

/// Number of parts needed for `total_length` bytes. Zero for an empty object;
/// callers send empty objects as a single request.
pub fn part_count(total_length: u64, part_size: u64) -> u32 {
    if total_length == 0 || part_size == 0 {
        return 0;
    }
    // optimal_part_size keeps this at or below MAX_PARTS
    total_length.div_ceil(part_size) as u32
}

/// Byte length of `part_number` (1-based)
pub fn part_length(part_number: u32, total_length: u64, part_size: u64) -> u64 {
    let start = (part_number as u64 - 1) * part_size;
    total_length.saturating_sub(start).min(part_size)
}

/// Source range covered by `part_number` (1-based)
pub fn part_range(part_number: u32, total_length: u64, part_size: u64) -> ByteRange {
    let start = (part_number as u64 - 1) * part_size;
    let end = (start + part_size).min(total_length) - 1;
    ByteRange::new(start, end)
}

/// All parts for an object of `total_length` bytes
pub fn describe_parts(total_length: u64, part_size: u64) -> Vec<PartDescriptor> {
    (1..=part_count(total_length, part_size))
        .map(|part_number| PartDescriptor {
            part_number,
            length: part_length(part_number, total_length, part_size),
            range: Some(part_range(part_number, total_length, part_size)),
        })
        .collect()
}
