//! Worker pair rotation

mod scheduler;
mod stats;

pub use scheduler::Scheduler;
pub use stats::{PoolStats, PoolStatus};

use tokio::sync::watch;

/// Handle for requesting a graceful shutdown of every long-running task
pub struct ShutdownHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

/// Suspend until shutdown is requested or every sender is gone
///
/// The borrow guard is released before returning, so callers can keep the
/// result across later awaits inside `tokio::select!` handlers.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new().0
    }
}
