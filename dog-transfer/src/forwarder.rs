//! Bounded-concurrency forwarding from a pull-based upstream to async operations.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_core::Stream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Write-once terminal cell. The first `complete` wins; later ones are
/// reported back to the caller as losers and dropped.
pub struct Terminal<T> {
    done: AtomicBool,
    value: Mutex<Option<T>>,
    notify: Notify,
}

impl<T> Terminal<T> {
    pub fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            value: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Store `value` unless a value was already stored. A losing value is handed back.
    pub fn complete(&self, value: T) -> Result<(), T> {
        let mut slot = self.value.lock();
        if self.done.swap(true, Ordering::AcqRel) {
            return Err(value);
        }
        *slot = Some(value);
        drop(slot);
        self.notify.notify_waiters();
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Take the stored value. The cell stays completed, so later writes still lose.
    pub fn take(&self) -> Option<T> {
        self.value.lock().take()
    }

    /// Wait until some caller completes the cell
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }
}

impl<T> Default for Terminal<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared count of operations currently in flight
#[derive(Clone, Debug, Default)]
pub struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn enter(&self) -> InFlightGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        InFlightGuard(self.0.clone())
    }
}

// Decrements on drop, so aborted operations are accounted for too.
pub(crate) struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// What happened by the time the forwarder went idle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardSummary {
    /// Items pulled from upstream and handed to the operation
    pub dispatched: usize,
    /// Operations that ran to completion
    pub finished: usize,
    /// True when the run stopped because the token was cancelled
    pub cancelled: bool,
}

/// Pulls items from an upstream and runs an async operation per item, never
/// holding more than `max_in_flight` operations at once.
///
/// Upstream is only polled while there is spare credit, so it never produces
/// more than the window allows. Operation failures are the operation's
/// business: it records them and cancels the token if the run should stop.
/// Cancellation stops pulling and aborts every operation still in flight.
pub struct BoundedForwarder {
    max_in_flight: usize,
    in_flight: InFlight,
    cancel: CancellationToken,
}

impl BoundedForwarder {
    pub fn new(max_in_flight: usize, cancel: CancellationToken) -> Self {
        Self {
            max_in_flight: max_in_flight.max(1),
            in_flight: InFlight::default(),
            cancel,
        }
    }

    /// Share an existing in-flight gauge (lets callers observe the window)
    pub fn with_gauge(mut self, gauge: InFlight) -> Self {
        self.in_flight = gauge;
        self
    }

    pub fn gauge(&self) -> InFlight {
        self.in_flight.clone()
    }

    /// Drive `upstream` to exhaustion.
    ///
    /// Resolves once upstream is finished (or cancelled) and every dispatched
    /// operation has ended. An upstream error is returned only after the
    /// in-flight count has drained to zero.
    pub async fn run<S, I, E, F, Fut>(self, upstream: S, mut op: F) -> Result<ForwardSummary, E>
    where
        S: Stream<Item = Result<I, E>>,
        F: FnMut(I) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut upstream = std::pin::pin!(upstream);
        let mut tasks = JoinSet::new();
        let mut summary = ForwardSummary::default();
        let mut upstream_done = false;
        let mut upstream_error = None;

        loop {
            while !upstream_done && !summary.cancelled && tasks.len() < self.max_in_flight {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        summary.cancelled = true;
                    }
                    next = upstream.next() => match next {
                        Some(Ok(item)) => {
                            let guard = self.in_flight.enter();
                            let fut = op(item);
                            tasks.spawn(async move {
                                let _guard = guard;
                                fut.await
                            });
                            summary.dispatched += 1;
                            trace!(in_flight = self.in_flight.get(), "dispatched");
                        }
                        Some(Err(err)) => {
                            upstream_done = true;
                            upstream_error = Some(err);
                        }
                        None => upstream_done = true,
                    },
                }
            }

            if summary.cancelled {
                tasks.abort_all();
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !summary.cancelled => {
                    summary.cancelled = true;
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok(())) => summary.finished += 1,
                    Some(Err(err)) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                    Some(Err(_)) | None => {}
                },
            }
        }

        match upstream_error {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }
}
