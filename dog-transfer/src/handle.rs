//! Control block shared between a running transfer task and its handle.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::forwarder::Terminal;
use crate::ResumeToken;

/// Where a transfer is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    NotStarted,
    /// Unknown-length upload waiting to learn whether it needs multipart
    BufferingFirstChunk,
    CreatingSession,
    Transferring,
    Completing,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Paused | Self::Cancelled)
    }
}

/// Produces a resume token from whatever progress a transfer has made
pub(crate) trait PauseSnapshot: Send + Sync {
    fn resume_token(&self) -> Option<ResumeToken>;
}

struct ControlInner {
    state: TransferState,
    pause_requested: bool,
    snapshot: Option<Arc<dyn PauseSnapshot>>,
}

pub(crate) struct TransferControl {
    cancel: CancellationToken,
    inner: Mutex<ControlInner>,
    finished: Terminal<()>,
}

impl TransferControl {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            cancel: CancellationToken::new(),
            inner: Mutex::new(ControlInner {
                state: TransferState::NotStarted,
                pause_requested: false,
                snapshot: None,
            }),
            finished: Terminal::new(),
        })
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn state(&self) -> TransferState {
        self.inner.lock().state
    }

    /// Move to a non-terminal state unless the transfer is already terminal
    pub(crate) fn advance(&self, state: TransferState) {
        let mut inner = self.inner.lock();
        if !inner.state.is_terminal() {
            inner.state = state;
        }
    }

    /// Make the transfer pausable from here on, capturing progress through `snapshot`
    pub(crate) fn set_snapshot(&self, snapshot: Arc<dyn PauseSnapshot>) {
        self.inner.lock().snapshot = Some(snapshot);
    }

    pub(crate) fn pause_requested(&self) -> bool {
        self.inner.lock().pause_requested
    }

    /// Enter the commit step. Returns false if a pause got there first, in
    /// which case the caller must stop without committing.
    pub(crate) fn begin_commit(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.pause_requested || self.cancel.is_cancelled() {
            return false;
        }
        inner.state = TransferState::Completing;
        true
    }

    /// Record the terminal state once the task is done
    pub(crate) fn finish(&self, state: TransferState) {
        {
            let mut inner = self.inner.lock();
            if !inner.state.is_terminal() {
                inner.state = state;
            }
        }
        let _ = self.finished.complete(());
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Request a pause and wait for the task to wind down.
    ///
    /// Returns None if the transfer is not pausable, already paused, or past
    /// the point of committing.
    pub(crate) async fn pause(&self) -> Option<ResumeToken> {
        {
            let mut inner = self.inner.lock();
            let pausable = matches!(
                inner.state,
                TransferState::NotStarted | TransferState::CreatingSession | TransferState::Transferring
            );
            if inner.pause_requested || !pausable || inner.snapshot.is_none() {
                return None;
            }
            inner.pause_requested = true;
        }

        self.cancel.cancel();
        self.finished.wait().await;

        // The task may have moved on to a newer snapshot while winding down
        let snapshot = {
            let mut inner = self.inner.lock();
            if inner.state != TransferState::Paused {
                // Finished or failed before the pause took effect
                return None;
            }
            inner.snapshot.take()?
        };
        snapshot.resume_token()
    }
}

/// Marks the control finished even if the task unwinds
pub(crate) struct FinishGuard {
    control: Arc<TransferControl>,
}

impl FinishGuard {
    pub(crate) fn new(control: Arc<TransferControl>) -> Self {
        Self { control }
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.control.finish(TransferState::Failed);
    }
}

/// Wait for a spawned transfer task and flatten join failures into transfer errors
pub(crate) async fn join_task<T>(task: tokio::task::JoinHandle<crate::TransferResult<T>>) -> crate::TransferResult<T> {
    match task.await {
        Ok(result) => result,
        Err(err) if err.is_cancelled() => Err(crate::TransferError::Cancelled),
        Err(err) => Err(crate::TransferError::invariant(format!("transfer task panicked: {}", err))),
    }
}

/// Terminal state for a finished task result
pub(crate) fn terminal_state<T>(result: &crate::TransferResult<T>) -> TransferState {
    match result {
        Ok(_) => TransferState::Completed,
        Err(crate::TransferError::Paused) => TransferState::Paused,
        Err(crate::TransferError::Cancelled) => TransferState::Cancelled,
        Err(_) => TransferState::Failed,
    }
}
