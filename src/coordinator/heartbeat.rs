//! Per-resource heartbeat worker.
//!
//! Runs only while its resource is owned. Renews the lease every quarter
//! TTL; a job is never left executing without a valid lease.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::lease::LeaseManager;
use crate::runset::RunSet;

pub struct HeartbeatWorker {
    resource: String,
    holder: String,
    leases: Arc<LeaseManager>,
    runset: Arc<dyn RunSet>,
    interval: Duration,
    ttl: Duration,
    failure_budget: u32,
    cancel: CancellationToken,
}

impl HeartbeatWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resource: String,
        holder: String,
        leases: Arc<LeaseManager>,
        runset: Arc<dyn RunSet>,
        interval: Duration,
        ttl: Duration,
        failure_budget: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            resource,
            holder,
            leases,
            runset,
            interval,
            ttl,
            failure_budget,
            cancel,
        }
    }

    /// Renew until cancelled or until the lease is gone.
    ///
    /// A renew that reports "no longer the holder" is fatal immediately: the
    /// job stops, but the running flag is left alone — whoever holds the
    /// lease now owns that flag. Transient store errors are tolerated up to
    /// the failure budget; past it the job stops *and* the flag is cleared,
    /// because no other instance can coordinate either while the store is
    /// down.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!(resource = %self.resource, "heartbeat worker stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.leases.renew(&self.resource, &self.holder, self.ttl) {
                Ok(true) => failures = 0,
                Ok(false) => {
                    tracing::error!(
                        resource = %self.resource,
                        holder = %self.holder,
                        "lease no longer held, stopping job"
                    );
                    self.stop_job("lease lost to another holder", false);
                    return;
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        resource = %self.resource,
                        error = %e,
                        failures,
                        budget = self.failure_budget,
                        "lease renewal failed"
                    );
                    if failures >= self.failure_budget {
                        tracing::error!(
                            resource = %self.resource,
                            "renewal failure budget exhausted, stopping job"
                        );
                        self.stop_job("lease store unreachable", true);
                        return;
                    }
                }
            }
        }
    }

    fn stop_job(&self, reason: &str, clear_running_flag: bool) {
        self.cancel.cancel();
        let line = format!("automation stopped: {reason}");
        if let Err(e) = self.runset.append_log(&self.resource, std::slice::from_ref(&line)) {
            tracing::warn!(resource = %self.resource, error = %e, "failed to log stop reason");
        }
        if clear_running_flag {
            if let Err(e) = self.runset.set_running(&self.resource, false) {
                tracing::warn!(
                    resource = %self.resource,
                    error = %e,
                    "failed to clear running flag"
                );
            }
        }
    }
}
