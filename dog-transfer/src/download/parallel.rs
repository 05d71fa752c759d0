use std::sync::Arc;

use super::{fail_part, DownloadJob, FetchOutcome, PartLayout};
use crate::forwarder::{BoundedForwarder, Terminal};
use crate::{TransferError, TransferResult};

/// Fetch `remaining` with at most `max_concurrency` parts in flight.
///
/// Part numbers are queued in order and a slot is refilled as each part
/// finishes, so completions arrive in any order. The first failure cancels
/// every part still running.
pub(super) async fn fetch(
    job: &Arc<DownloadJob>,
    remaining: Vec<u32>,
    layout: &PartLayout,
) -> TransferResult<FetchOutcome> {
    let cancel = job.control.token().child_token();
    let failure = Arc::new(Terminal::new());
    let pending = futures_util::stream::iter(remaining.into_iter().map(Ok::<u32, TransferError>));

    let summary = BoundedForwarder::new(job.config.max_concurrency, cancel.clone())
        .with_gauge(job.gauge.clone())
        .run(pending, |part_number| {
            let job = job.clone();
            let layout = layout.clone();
            let failure = failure.clone();
            let cancel = cancel.clone();
            async move {
                if let Err(err) = fetch_part(&job, part_number, &layout).await {
                    fail_part(&failure, &cancel, part_number, err);
                }
            }
        })
        .await?;

    if let Some(err) = failure.take() {
        return Err(err);
    }
    Ok(if summary.cancelled {
        FetchOutcome::Stopped
    } else {
        FetchOutcome::Finished
    })
}

async fn fetch_part(job: &DownloadJob, part_number: u32, layout: &PartLayout) -> TransferResult<()> {
    let _reservation = job.budget.reserve(layout.part_size).await?;
    job.transfer_part(part_number, layout).await
}
