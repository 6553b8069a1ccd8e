//! Shared runtime status.
//!
//! Bringup stages and connection health, readable by the pinger at any time.
//! Writers mutate under a lock and readers take a whole-struct copy, so a
//! reader never observes a half-updated snapshot.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Completion flags for the ordered bringup stages.
///
/// Only the supervisor sets these; the parser owns `tcp_connected` on the
/// enclosing snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BringupStages {
    pub config: bool,
    pub database: bool,
    pub decoder: bool,
    pub dependencies: bool,
    pub tcp_connection: bool,
    pub time_sync: bool,
}

/// One consistent view of process health.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub stages: BringupStages,
    pub tcp_connected: bool,
    pub started_at: DateTime<Utc>,
    pub system_info: String,
}

impl StatusSnapshot {
    fn new() -> Self {
        Self {
            stages: BringupStages::default(),
            tcp_connected: false,
            started_at: Utc::now(),
            system_info: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
        }
    }

    /// Seconds since process start.
    pub fn uptime_seconds(&self, now: DateTime<Utc>) -> f64 {
        (now - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

/// Cloneable handle to the shared snapshot.
#[derive(Debug, Clone)]
pub struct StatusHandle {
    inner: Arc<Mutex<StatusSnapshot>>,
}

impl StatusHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StatusSnapshot::new())),
        }
    }

    /// Atomic copy of the current state.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.lock().clone()
    }

    pub fn set_stage(&self, update: impl FnOnce(&mut BringupStages)) {
        update(&mut self.lock().stages);
    }

    pub fn set_tcp_connected(&self, connected: bool) {
        self.lock().tcp_connected = connected;
    }

    // Status is health reporting; a writer that panicked mid-update must not
    // take the pinger down with it.
    fn lock(&self) -> std::sync::MutexGuard<'_, StatusSnapshot> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for StatusHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_stage_writes() {
        let handle = StatusHandle::new();
        assert!(!handle.snapshot().stages.database);

        handle.set_stage(|s| s.database = true);
        handle.set_tcp_connected(true);

        let snap = handle.snapshot();
        assert!(snap.stages.database);
        assert!(snap.tcp_connected);
        assert!(!snap.stages.decoder);
    }

    #[test]
    fn uptime_is_positive_and_fractional() {
        let handle = StatusHandle::new();
        let snap = handle.snapshot();
        let later = snap.started_at + chrono::Duration::milliseconds(1500);
        assert_eq!(snap.uptime_seconds(later), 1.5);
    }
}
