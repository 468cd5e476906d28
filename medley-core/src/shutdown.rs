//! Two-phase shutdown coordination.
//!
//! The first `SIGTERM` flips the application into graceful drain: pools
//! refuse new queries and each worker finishes the requests it already
//! accepted. A second `SIGTERM` forces immediate exit of the worker loops.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::Notify;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    /// Drain current requests, refuse new work.
    Graceful,
    /// Exit worker loops immediately.
    Hard,
}

const PHASE_RUNNING: u8 = 0;
const PHASE_GRACEFUL: u8 = 1;
const PHASE_HARD: u8 = 2;

/// Shared shutdown register. Cloneable via `Arc`; workers poll the phase at
/// their suspension points or await [`ShutdownCoordinator::changed`].
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    phase: AtomicU8,
    notify: Notify,
}

impl ShutdownCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn phase(&self) -> ShutdownPhase {
        match self.phase.load(Ordering::Acquire) {
            PHASE_GRACEFUL => ShutdownPhase::Graceful,
            PHASE_HARD => ShutdownPhase::Hard,
            _ => ShutdownPhase::Running,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.phase() != ShutdownPhase::Running
    }

    /// Advance one phase: running -> graceful -> hard. Returns the phase
    /// after the escalation.
    pub fn escalate(&self) -> ShutdownPhase {
        let prev = self
            .phase
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |curr| {
                Some(curr.saturating_add(1).min(PHASE_HARD))
            })
            .unwrap_or(PHASE_HARD);
        self.notify.notify_waiters();
        match prev {
            PHASE_RUNNING => {
                info!("graceful shutdown requested, draining current requests");
                ShutdownPhase::Graceful
            }
            _ => {
                warn!("hard shutdown requested, forcing worker exit");
                ShutdownPhase::Hard
            }
        }
    }

    /// Resolve on the next phase change.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }
}

/// Bind the coordinator to `SIGTERM`: the first delivery escalates to
/// graceful, the second to hard. The returned task runs for the process
/// lifetime.
#[cfg(unix)]
pub fn install_sigterm_handler(
    coordinator: Arc<ShutdownCoordinator>,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(tokio::spawn(async move {
        loop {
            if sigterm.recv().await.is_none() {
                return;
            }
            if coordinator.escalate() == ShutdownPhase::Hard {
                return;
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn phases_escalate_in_order() {
        let coord = ShutdownCoordinator::new();
        assert_eq!(coord.phase(), ShutdownPhase::Running);
        assert!(!coord.is_shutting_down());

        assert_eq!(coord.escalate(), ShutdownPhase::Graceful);
        assert_eq!(coord.phase(), ShutdownPhase::Graceful);

        assert_eq!(coord.escalate(), ShutdownPhase::Hard);
        assert_eq!(coord.phase(), ShutdownPhase::Hard);

        // further escalations saturate
        assert_eq!(coord.escalate(), ShutdownPhase::Hard);
    }

    #[tokio::test]
    async fn waiters_observe_phase_changes() {
        let coord = ShutdownCoordinator::new();
        let waiter = {
            let coord = Arc::clone(&coord);
            tokio::spawn(async move {
                coord.changed().await;
                coord.phase()
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        coord.escalate();
        assert_eq!(waiter.await.unwrap(), ShutdownPhase::Graceful);
    }
}
