use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, WardenError};

/// Configuration for a coordinator instance.
///
/// Two directories matter:
/// - `data_dir` holds the shared tables (leases, liveness, running set) and
///   must be visible to every instance that coordinates over them.
/// - `instance_dir` holds this deployment slot's private state (instance id,
///   origin ledger) and must survive restarts of the slot.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Directory for the shared store tables.
    pub data_dir: PathBuf,
    /// Directory for slot-local state. Defaults to `data_dir`.
    pub instance_dir: PathBuf,
    /// How long an unrenewed lease stays valid.
    pub lease_ttl: Duration,
    /// Interval between failover poll ticks.
    pub poll_interval: Duration,
    /// Interval between liveness publishes.
    pub liveness_interval: Duration,
    /// How long a liveness record stays valid without a new publish.
    pub liveness_ttl: Duration,
    /// Consecutive transient renew failures tolerated before the heartbeat
    /// worker stops the job. A confirmed loss of ownership stops it at once.
    pub heartbeat_failure_budget: u32,
    /// Attempts to confirm the running-flag write after a successful acquire
    /// before giving the lease back.
    pub flag_write_budget: u32,
}

impl CoordinatorConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            instance_dir: data_dir.clone(),
            data_dir,
            lease_ttl: Duration::from_secs(20),
            poll_interval: Duration::from_secs(3),
            liveness_interval: Duration::from_secs(5),
            liveness_ttl: Duration::from_secs(20),
            heartbeat_failure_budget: 3,
            flag_write_budget: 5,
        }
    }

    pub fn with_instance_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.instance_dir = dir.into();
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_liveness(mut self, interval: Duration, ttl: Duration) -> Self {
        self.liveness_interval = interval;
        self.liveness_ttl = ttl;
        self
    }

    /// Lease renewal interval: a quarter of the TTL, floored at 10ms, so a
    /// couple of missed renewals still leave the lease alive.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.lease_ttl / 4).max(Duration::from_millis(10))
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease_ttl.is_zero() {
            return Err(WardenError::Config("lease_ttl must be non-zero".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(WardenError::Config("poll_interval must be non-zero".into()));
        }
        if self.liveness_ttl <= self.liveness_interval {
            return Err(WardenError::Config(
                "liveness_ttl must exceed liveness_interval".into(),
            ));
        }
        if self.heartbeat_failure_budget == 0 || self.flag_write_budget == 0 {
            return Err(WardenError::Config("budgets must be at least 1".into()));
        }
        Ok(())
    }
}
