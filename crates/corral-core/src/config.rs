//! Engine configuration. Immutable after startup; there is no other
//! cross-request memory.

use chrono::TimeDelta;

/// Tunables for the lifecycle engine, claim selector, and reconciler.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Lease granted to a claim when the request does not ask for one.
    pub default_lease_secs: u64,
    /// Hard upper bound on requested lease durations.
    pub max_lease_secs: u64,
    /// How often orchestrators are expected to heartbeat.
    pub heartbeat_interval_secs: u64,
    /// Silence after which an active orchestrator is marked offline.
    pub stale_orchestrator_secs: u64,
    /// Page size for list endpoints when the request does not ask for one.
    pub default_page_size: i64,
    /// Hard upper bound on requested page sizes.
    pub max_page_size: i64,
    /// Submissions with zero commits and at least this many turns route to
    /// `needs_continuation`.
    pub burnout_turn_threshold: i32,
    /// Submissions with at least this many turns route to
    /// `needs_continuation` regardless of commits.
    pub max_turn_limit: i32,
    /// Cadence of the lease reconciler when run inside the server.
    pub reconcile_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_lease_secs: 300,
            max_lease_secs: 3600,
            heartbeat_interval_secs: 30,
            stale_orchestrator_secs: 120,
            default_page_size: 50,
            max_page_size: 500,
            burnout_turn_threshold: 80,
            max_turn_limit: 100,
            reconcile_interval_secs: 60,
        }
    }
}

impl EngineConfig {
    /// Resolve a requested lease duration against the default and the cap.
    pub fn lease_duration(&self, requested_secs: Option<u64>) -> TimeDelta {
        let secs = requested_secs
            .unwrap_or(self.default_lease_secs)
            .min(self.max_lease_secs);
        TimeDelta::seconds(secs as i64)
    }

    /// Resolve a requested page size against the default and the cap.
    pub fn page_size(&self, requested: Option<i64>) -> i64 {
        match requested {
            Some(n) if n > 0 => n.min(self.max_page_size),
            _ => self.default_page_size,
        }
    }
}
