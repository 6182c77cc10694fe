//! Fetch-lock scheduling and per-lease execution.

pub mod lease;
pub mod runner;
pub mod scheduler;
pub mod workspace;

pub use lease::{Lease, LeaseState, TerminalReport};
pub use runner::TaskRunner;
pub use scheduler::Scheduler;
pub use workspace::Workspace;

use tokio::sync::watch;

/// Cooperative shutdown flag shared by the driver and all runners.
/// Triggering it is sticky; subscribers observe it race-free through the
/// watch channel.
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Begin graceful shutdown: the driver stops fetching, runners stop
    /// renewing locks and wind their subprocesses down.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
