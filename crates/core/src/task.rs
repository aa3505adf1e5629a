//! Cancellation plumbing shared by every polling loop.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pairs a [`CancellationToken`] with a write lock.
///
/// Loops route every state write through [`CancelGate::publish`]. Because the
/// cancelled flag is flipped under the same lock, once [`CancelGate::cancel`]
/// returns no further write from the loop can land.
#[derive(Debug, Default)]
pub struct CancelGate {
    cancelled: Mutex<bool>,
    token: CancellationToken,
}

impl CancelGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token loops select on at their suspension points.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Idempotent.
    pub fn cancel(&self) {
        let mut cancelled = self.cancelled.lock();
        *cancelled = true;
        self.token.cancel();
    }

    /// Runs one last `write` and cancels, atomically with respect to every
    /// other write. Does nothing if already cancelled.
    pub fn cancel_with(&self, write: impl FnOnce()) {
        let mut cancelled = self.cancelled.lock();
        if !*cancelled {
            write();
            *cancelled = true;
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.lock()
    }

    /// Runs `write` unless the gate has been cancelled. The closure must not
    /// block.
    pub fn publish<R>(&self, write: impl FnOnce() -> R) -> Option<R> {
        let cancelled = self.cancelled.lock();
        if *cancelled {
            None
        } else {
            Some(write())
        }
    }
}

/// Owner-side handle of a spawned loop.
#[derive(Debug)]
pub struct LoopHandle {
    gate: Arc<CancelGate>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LoopHandle {
    pub fn new(gate: Arc<CancelGate>, task: JoinHandle<()>) -> Self {
        Self {
            gate,
            task: Mutex::new(Some(task)),
        }
    }

    /// Stops future scheduling and blocks any later write. Safe to call more
    /// than once.
    pub fn cancel(&self) {
        self.gate.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.gate.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|task| task.is_finished())
            .unwrap_or(true)
    }

    /// Cancels the loop and waits for its task to wind down.
    pub async fn shutdown(&self) {
        self.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                if err.is_panic() {
                    tracing::warn!(%err, "loop task panicked");
                }
            }
        }
    }
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        self.gate.cancel();
    }
}
