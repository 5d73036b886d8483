//! Stats sync
//!
//! The connection manager keeps its own view of every accelerated flow
//! (conntrack counters, TCP window state, timers). The engine reports what
//! it forwarded through a [`SyncCallback`]:
//!
//! - periodically, a bounded walk over connections with pending deltas
//! - once more when a connection is torn down
//!
//! The engine lock is never held while the callback runs.

use crate::core::{Engine, EngineError};
use fastpath_common::{FlowTuple, Timestamp};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Why a report was generated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncReason {
    /// Periodic walk
    Stats,
    /// The fast path tore the connection down
    Flush,
    /// The connection manager destroyed the rule
    Destroy,
}

/// TCP state of one direction at report time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TcpState {
    /// Largest window seen
    pub max_window: u32,
    /// Highest segment end sent
    pub end: u32,
    /// Highest sequence the peer allows
    pub max_end: u32,
}

/// One connection's report
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSync {
    /// Connection id, in creation order
    pub id: u64,
    /// IP protocol number
    pub protocol: u8,
    /// Pre-translation tuple
    pub original: FlowTuple,
    /// Post-translation tuple
    pub translated: FlowTuple,
    /// Original direction TCP state
    pub src_tcp: TcpState,
    /// Reply direction TCP state
    pub dest_tcp: TcpState,
    /// Original direction packets since the previous report
    pub src_new_packets: u32,
    /// Original direction bytes since the previous report
    pub src_new_bytes: u32,
    /// Reply direction packets since the previous report
    pub dest_new_packets: u32,
    /// Reply direction bytes since the previous report
    pub dest_new_bytes: u32,
    /// Original direction packet total
    pub src_packets: u64,
    /// Original direction byte total
    pub src_bytes: u64,
    /// Reply direction packet total
    pub dest_packets: u64,
    /// Reply direction byte total
    pub dest_bytes: u64,
    /// Interface the original direction arrives on
    pub src_dev: u32,
    /// Interface the reply direction arrives on
    pub dest_dev: u32,
    /// Connection mark
    pub mark: u32,
    /// What triggered the report
    pub reason: SyncReason,
    /// Time since the previous report for this connection
    pub delta: Duration,
}

/// Receives connection reports
pub trait SyncCallback: Send + Sync {
    /// Called without the table lock held
    fn sync(&self, report: &ConnectionSync);
}

impl<F> SyncCallback for F
where
    F: Fn(&ConnectionSync) + Send + Sync,
{
    fn sync(&self, report: &ConnectionSync) {
        self(report)
    }
}

/// Connections a walk over `n` connections may report
#[inline]
pub fn sync_quota(n: usize) -> usize {
    (n + 63) / 64
}

impl Engine {
    /// Install, replace or (with `None`) remove the report sink
    pub fn register_sync_callback(&self, callback: Option<Arc<dyn SyncCallback>>) {
        let installed = callback.is_some();
        self.table.lock().sync_callback = callback;
        tracing::info!(installed, "sync callback updated");
    }

    /// One bounded walk of the traversal list. Returns the connections reported.
    ///
    /// Connections without pending packets are skipped without using quota.
    /// The walk resumes where the previous one stopped.
    pub fn sync_pass(&self) -> usize {
        let now = Timestamp::now();
        let mut state = self.table.lock();
        let Some(callback) = state.sync_callback.clone() else {
            return 0;
        };

        let mut quota = sync_quota(state.len());
        let mut cursor = state.sync_cursor;
        let mut synced = 0;

        while quota > 0 {
            let Some(conn) = state.iter_from(cursor).find(|c| c.has_pending()).cloned() else {
                cursor = None;
                break;
            };

            quota -= 1;
            let report = conn.snapshot(SyncReason::Stats, now);
            state.sync_cursor = Some(conn.id + 1);

            parking_lot::MutexGuard::unlocked(&mut state, || callback.sync(&report));
            synced += 1;

            // Reread: a connection at the cursor may have gone meanwhile, the
            // id range lookup copes with that
            cursor = state.sync_cursor;
        }

        state.sync_cursor = cursor;
        drop(state);

        if synced > 0 {
            tracing::trace!(synced, "periodic sync");
        }
        synced
    }

    /// Run [`Engine::sync_pass`] on the configured cadence.
    ///
    /// Must be called from within a tokio runtime. The task holds only a
    /// weak reference and ends once the engine is dropped.
    pub fn start_sync_task(self: &Arc<Self>) -> Result<(), EngineError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| EngineError::NoRuntime)?;

        let mut task = self.sync_task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Err(EngineError::AlreadyRunning);
        }

        let engine = Arc::downgrade(self);
        let period = self.config.sync_interval();

        *task = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.sync_pass();
                engine.stats().publish();
            }
            tracing::debug!("sync task exiting");
        }));

        tracing::info!(interval_ms = period.as_millis() as u64, "sync task started");
        Ok(())
    }

    /// Stop the periodic task, if running
    pub fn stop_sync_task(&self) {
        if let Some(task) = self.sync_task.lock().take() {
            task.abort();
            tracing::info!("sync task stopped");
        }
    }

    /// Whether the periodic task is alive
    pub fn sync_task_running(&self) -> bool {
        self.sync_task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }
}
