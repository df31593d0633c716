//! The two one-way interfaces between the orchestrator and the supervisor.
//!
//! The orchestrator reports scans in flight through `ScanCounter`;
//! scan-sensitive sources (virus databases swap files the scanner is
//! reading) defer their updates while the count is non-zero. The supervisor
//! answers readiness questions through `ReadinessProvider`; scanners refuse
//! to start until their required sources are ready.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Orchestrator-side counter of scans in flight.
pub trait ScanCounter: Send + Sync {
    fn begin_scan(&self);
    fn end_scan(&self);
    fn active_scans(&self) -> usize;
}

/// Supervisor-side answer to "is this source usable right now?".
pub trait ReadinessProvider: Send + Sync {
    fn is_ready(&self, source: &str) -> bool;
}

/// Always-ready provider for air-gapped mode (`skip_db_update`) and tests.
pub struct NoopReadiness;

impl ReadinessProvider for NoopReadiness {
    fn is_ready(&self, _source: &str) -> bool {
        true
    }
}

/// Shared scan gate: an atomic counter with a wakeup for waiters.
#[derive(Default)]
pub struct ScanGate {
    active: AtomicUsize,
    idle: Notify,
}

impl ScanGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wait until no scans are in flight. Returns immediately when idle.
    pub async fn wait_idle(&self) {
        loop {
            // Register before checking so an end_scan racing the check is
            // not missed.
            let notified = self.idle.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl ScanCounter for ScanGate {
    fn begin_scan(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    fn end_scan(&self) {
        let previous = self.active.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "end_scan without matching begin_scan");
        if previous <= 1 {
            self.idle.notify_waiters();
        }
    }

    fn active_scans(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn gate_counts_and_wakes_waiters() {
        let gate = ScanGate::new();
        gate.begin_scan();
        gate.begin_scan();
        assert_eq!(gate.active_scans(), 2);

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                gate.wait_idle().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        gate.end_scan();
        gate.end_scan();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake once idle")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_idle_returns_immediately_when_idle() {
        let gate = ScanGate::new();
        tokio::time::timeout(Duration::from_millis(50), gate.wait_idle())
            .await
            .expect("idle gate should not block");
    }
}
