use std::sync::Arc;

use super::{DownloadJob, FetchOutcome, PartLayout};
use crate::TransferResult;

/// Fetch `remaining` one part at a time, in order
pub(super) async fn fetch(
    job: &Arc<DownloadJob>,
    remaining: Vec<u32>,
    layout: &PartLayout,
) -> TransferResult<FetchOutcome> {
    for part_number in remaining {
        let _in_flight = job.gauge.enter();
        tokio::select! {
            biased;
            _ = job.control.token().cancelled() => return Ok(FetchOutcome::Stopped),
            stored = job.transfer_part(part_number, layout) => stored?,
        }
    }
    Ok(FetchOutcome::Finished)
}
