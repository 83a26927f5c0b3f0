//! Timing and policy knobs for the cluster layer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ClusterError;

/// Cluster configuration. Missing fields take their defaults, so a partial
/// `[cluster]` table in a config file is fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Silence after which a node is suspected failing.
    pub node_timeout_ms: u64,
    /// How often the host calls `tick`.
    pub cron_interval_ms: u64,
    /// A replica whose data is older than `node_timeout * factor` (plus the
    /// replication ping period) won't fail over. Zero disables the check.
    pub replica_validity_factor: u32,
    pub repl_ping_period_secs: u64,
    /// Never start an automatic failover from this node.
    pub replica_no_failover: bool,
    /// Refuse all requests while any slot is unserved.
    pub require_full_coverage: bool,
    /// Fixed part of the delay before a replica requests votes.
    pub failover_delay_ms: u64,
    /// Random part of that delay, in `0..failover_jitter_ms`.
    pub failover_jitter_ms: u64,
    /// Extra delay per rank position.
    pub failover_rank_delay_ms: u64,
    pub manual_failover_timeout_ms: u64,
    /// Nodes sampled when picking the periodic ping target.
    pub ping_sample_size: usize,
    /// Ticks between sampled pings.
    pub ping_sample_every_ticks: u32,
    /// How long a forgotten node stays blacklisted.
    pub forget_ttl_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_timeout_ms: 15_000,
            cron_interval_ms: 100,
            replica_validity_factor: 10,
            repl_ping_period_secs: 10,
            replica_no_failover: false,
            require_full_coverage: true,
            failover_delay_ms: 500,
            failover_jitter_ms: 500,
            failover_rank_delay_ms: 1000,
            manual_failover_timeout_ms: 5000,
            ping_sample_size: 5,
            ping_sample_every_ticks: 10,
            forget_ttl_secs: 60,
        }
    }
}

const MAX_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;
const MAX_DELAY_MS: u64 = 60 * 60 * 1000;
const MAX_SECS: u64 = 24 * 60 * 60;

/// Rejects `value` above `max`.
fn at_most(name: &str, value: u64, max: u64) -> Result<(), ClusterError> {
    if value > max {
        return Err(ClusterError::Configuration(format!(
            "{name} must be at most {max}, got {value}"
        )));
    }
    Ok(())
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.node_timeout_ms == 0 {
            return Err(ClusterError::Configuration(
                "node_timeout_ms must be positive".into(),
            ));
        }
        if self.cron_interval_ms == 0 {
            return Err(ClusterError::Configuration(
                "cron_interval_ms must be positive".into(),
            ));
        }
        if self.ping_sample_size == 0 || self.ping_sample_every_ticks == 0 {
            return Err(ClusterError::Configuration(
                "ping sampling parameters must be positive".into(),
            ));
        }
        at_most("node_timeout_ms", self.node_timeout_ms, MAX_TIMEOUT_MS)?;
        at_most("cron_interval_ms", self.cron_interval_ms, MAX_DELAY_MS)?;
        at_most("failover_delay_ms", self.failover_delay_ms, MAX_DELAY_MS)?;
        at_most("failover_jitter_ms", self.failover_jitter_ms, MAX_DELAY_MS)?;
        at_most("failover_rank_delay_ms", self.failover_rank_delay_ms, MAX_DELAY_MS)?;
        at_most(
            "manual_failover_timeout_ms",
            self.manual_failover_timeout_ms,
            MAX_TIMEOUT_MS,
        )?;
        at_most("repl_ping_period_secs", self.repl_ping_period_secs, MAX_SECS)?;
        at_most("forget_ttl_secs", self.forget_ttl_secs, MAX_SECS)?;
        Ok(())
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn cron_interval(&self) -> Duration {
        Duration::from_millis(self.cron_interval_ms)
    }

    /// Fail reports older than this are ignored.
    pub fn fail_report_validity(&self) -> Duration {
        self.node_timeout() * 2
    }

    /// A failed master that answers within this window gets its FAIL cleared.
    pub fn fail_undo_window(&self) -> Duration {
        self.node_timeout() * 2
    }

    /// Provisional nodes that haven't completed the handshake by then are
    /// dropped.
    pub fn handshake_timeout(&self) -> Duration {
        self.node_timeout().max(Duration::from_secs(1))
    }

    /// Window for collecting votes.
    pub fn auth_timeout(&self) -> Duration {
        (self.node_timeout() * 2).max(Duration::from_secs(2))
    }

    /// Minimum spacing between election attempts.
    pub fn auth_retry_time(&self) -> Duration {
        self.auth_timeout() * 2
    }

    /// Maximum replication data age that still allows failover.
    pub fn max_data_age(&self) -> Option<Duration> {
        (self.replica_validity_factor > 0).then(|| {
            self.node_timeout() * self.replica_validity_factor
                + Duration::from_secs(self.repl_ping_period_secs)
        })
    }

    pub fn manual_failover_timeout(&self) -> Duration {
        Duration::from_millis(self.manual_failover_timeout_ms)
    }

    pub fn forget_ttl(&self) -> Duration {
        Duration::from_secs(self.forget_ttl_secs)
    }
}
