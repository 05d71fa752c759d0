use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::trace;

use super::{fail_part, propagate_panic, DownloadJob, FetchOutcome, PartLayout};
use crate::forwarder::Terminal;
use crate::TransferResult;

/// Issue the GETs for `remaining` one after another and hand each response
/// body to its own writer task.
///
/// Bodies drain into the sink concurrently, so parts land in whatever order
/// they finish. The byte budget bounds how many bodies can be pending at once.
pub(super) async fn fetch(
    job: &Arc<DownloadJob>,
    remaining: Vec<u32>,
    layout: &PartLayout,
) -> TransferResult<FetchOutcome> {
    let cancel = job.control.token().child_token();
    let failure = Arc::new(Terminal::new());
    let mut writers = JoinSet::new();

    for part_number in remaining {
        let reservation = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            reserved = job.budget.reserve(layout.part_size) => reserved?,
        };
        let in_flight = job.gauge.enter();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            response = job.get_part(part_number, layout) => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                fail_part(&failure, &cancel, part_number, err);
                break;
            }
        };

        let job = job.clone();
        let failure = failure.clone();
        let cancel = cancel.clone();
        let part_size = layout.part_size;
        writers.spawn(async move {
            let _in_flight = in_flight;
            let stored = match job.write_part(part_number, response, part_size).await {
                Ok(written) => job.record(part_number, written),
                Err(err) => Err(err),
            };
            drop(reservation);
            if let Err(err) = stored {
                fail_part(&failure, &cancel, part_number, err);
            }
        });
        trace!(part_number, writers = writers.len(), "handed body to writer");

        while let Some(joined) = writers.try_join_next() {
            propagate_panic(joined);
        }
    }

    let mut aborted = false;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled(), if !aborted => {
                writers.abort_all();
                aborted = true;
            }
            joined = writers.join_next() => match joined {
                Some(joined) => propagate_panic(joined),
                None => break,
            },
        }
    }

    if let Some(err) = failure.take() {
        return Err(err);
    }
    Ok(if cancel.is_cancelled() {
        FetchOutcome::Stopped
    } else {
        FetchOutcome::Finished
    })
}
