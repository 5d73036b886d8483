//! Core Fast Path Engine
//!
//! One explicit engine context owns the connection table, the per-core
//! stats and the seams to the host stack (interface registry, egress).
//! The packet hook and the rule API are methods on it; nothing is global.

use crate::connection::Connection;
use crate::cookie::FlowCookieSetter;
use crate::interface::{Egress, InterfaceTable};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::sync::{SyncCallback, SyncReason};
use crate::table::ConnectionTable;
use fastpath_common::error::ConfigError;
use fastpath_common::{FlowTuple, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Fast Path Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of per-core stat shards
    pub num_shards: usize,
    /// Connection capacity; `create_rule` fails past it
    pub max_connections: usize,
    /// Periodic sync cadence (milliseconds)
    pub sync_interval_ms: u64,
    /// Consult hardware flow cookies on lookup
    pub flow_cookie_enable: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_shards: num_cpus(),
            max_connections: 1 << 18,
            sync_interval_ms: 100,
            flow_cookie_enable: false,
        }
    }
}

impl EngineConfig {
    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_shards == 0 {
            return Err(ConfigError::Invalid {
                field: "num_shards",
                reason: "must be at least 1".into(),
            });
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid {
                field: "max_connections",
                reason: "must be at least 1".into(),
            });
        }
        if self.sync_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "sync_interval_ms",
                reason: "must be non-zero".into(),
            });
        }
        Ok(())
    }

    /// Periodic sync cadence
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}

/// Get number of CPUs (simplified)
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Engine errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The periodic sync task is already started
    #[error("sync task already running")]
    AlreadyRunning,

    /// Called outside a tokio runtime
    #[error("no tokio runtime available")]
    NoRuntime,

    /// Rejected configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Another flow cookie setter is installed
    #[error("flow cookie setter already registered")]
    CookieSetterRegistered,
}

/// Fast Path Engine
///
/// Shared by reference between receive contexts and the control plane:
/// - [`Engine::recv`] from any number of cores, never blocking
/// - rule management serialized on the table lock
/// - an optional tokio task driving the periodic stats sync
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) table: ConnectionTable,
    pub(crate) stats: EngineStats,
    pub(crate) interfaces: Arc<dyn InterfaceTable>,
    pub(crate) egress: Arc<dyn Egress>,
    pub(crate) sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Create new engine with config
    pub fn new(
        config: EngineConfig,
        interfaces: Arc<dyn InterfaceTable>,
        egress: Arc<dyn Egress>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        tracing::info!(
            shards = config.num_shards,
            max_connections = config.max_connections,
            flow_cookies = config.flow_cookie_enable,
            "fast path engine created"
        );

        Ok(Self {
            table: ConnectionTable::new(config.flow_cookie_enable),
            stats: EngineStats::new(config.num_shards),
            config,
            interfaces,
            egress,
            sync_task: Mutex::new(None),
        })
    }

    /// Configuration the engine was built with
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Aggregate stats over all shards
    pub fn stats(&self) -> StatsSnapshot {
        let mut snap = self.stats.total();
        snap.connections = self.table.len() as u64;
        snap
    }

    /// Per-core counter shards
    pub fn core_stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Connection for a pre-translation tuple
    pub fn find(&self, tuple: &FlowTuple) -> Option<Arc<Connection>> {
        self.table.find(tuple)
    }

    /// Connections currently accelerated
    pub fn connection_count(&self) -> usize {
        self.table.len()
    }

    /// Runtime switch for the flow cookie lookup shortcut
    pub fn set_flow_cookie_enable(&self, on: bool) {
        self.table.set_cookies_enabled(on);
        tracing::info!(enabled = on, "flow cookies toggled");
    }

    /// Whether lookups consult flow cookies
    pub fn flow_cookie_enabled(&self) -> bool {
        self.table.cookies_enabled()
    }

    /// Install the hardware cookie programmer. Only one may be registered.
    pub fn register_flow_cookie_setter(&self, setter: Arc<dyn FlowCookieSetter>) -> Result<(), EngineError> {
        let mut state = self.table.lock();
        if state.cookie_setter.is_some() {
            return Err(EngineError::CookieSetterRegistered);
        }
        state.cookie_setter = Some(setter);
        tracing::info!("flow cookie setter registered");
        Ok(())
    }

    /// Remove the cookie programmer; slots already programmed stay valid
    pub fn unregister_flow_cookie_setter(&self) {
        self.table.lock().cookie_setter = None;
        tracing::info!("flow cookie setter unregistered");
    }

    /// Unlink `conn` and send its final report.
    ///
    /// Returns false if someone else removed it first; only the remover reports.
    pub(crate) fn remove_and_flush(&self, conn: &Arc<Connection>, reason: SyncReason) -> bool {
        let now = Timestamp::now();
        let callback = {
            let mut state = self.table.lock();
            if !self.table.remove(&mut state, conn, now) {
                return false;
            }
            state.sync_callback.clone()
        };
        self.flush(conn, reason, callback, now);
        true
    }

    /// Final report for a connection already unlinked. Never called under the lock.
    pub(crate) fn flush(
        &self,
        conn: &Connection,
        reason: SyncReason,
        callback: Option<Arc<dyn SyncCallback>>,
        now: Timestamp,
    ) {
        self.stats.local().record_flush();
        tracing::debug!(conn = %conn.original, ?reason, "connection flushed");
        if let Some(callback) = callback {
            callback.sync(&conn.snapshot(reason, now));
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_sync_task();
    }
}
