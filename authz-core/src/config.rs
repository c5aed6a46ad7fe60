use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Whether decisions (not mutations) are written to the audit trail.
/// Mutation auditing is mandatory and not configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAuditMode {
    Off,
    Always,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on how long a cached capability set survives. Bounds the
    /// staleness of a cached allow; a stale deny after a grant is acceptable.
    pub cache_ttl_secs: u64,
    pub decision_audit: DecisionAuditMode,
    /// Interval of the expiration sweep.
    pub sweep_interval_secs: u64,
    /// Upper bound on any single store or audit call made by the engine. A
    /// hung connection fails the operation instead of stalling it; a timed
    /// out audit write takes the same rollback path as a failed one.
    pub op_timeout_secs: u64,
}

impl EngineConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            decision_audit: DecisionAuditMode::Off,
            sweep_interval_secs: 60,
            op_timeout_secs: 10,
        }
    }
}
