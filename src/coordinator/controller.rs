//! The failover controller.
//!
//! Each instance runs one coordinator. Its poll loop walks the running set
//! every tick and, per resource, decides to take over, hand back, or merely
//! monitor; a separate loop publishes this instance's liveness record. All
//! cross-instance coordination goes through the shared tables — nothing
//! in-memory is assumed visible to other processes.
//!
//! Per-resource states, per tick:
//! - unheld and should run: try to acquire; the store's compare-and-swap
//!   picks exactly one winner out of any thundering herd, everyone else
//!   just polls again.
//! - held by us via takeover: hand back as soon as some other instance
//!   reports itself alive as primary.
//! - held by someone else: observe only.
//! - held by us but no longer in the running set: stop and release.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::CoordinatorConfig;
use crate::coordinator::heartbeat::HeartbeatWorker;
use crate::coordinator::registry::{ResourceHandle, ResourceRegistry};
use crate::error::{Result, WardenError};
use crate::identity::{InstanceId, OriginLedger};
use crate::lease::LeaseManager;
use crate::runner::JobRunner;
use crate::runset::{ResourceSpec, RunSet};
use crate::store::liveness::{LivenessRegistry, Role};

/// Pause between attempts to confirm the running-flag write after a
/// successful acquire.
const FLAG_WRITE_RETRY_PAUSE: Duration = Duration::from_millis(250);

pub struct Coordinator {
    config: CoordinatorConfig,
    instance: InstanceId,
    leases: Arc<LeaseManager>,
    liveness: Arc<LivenessRegistry>,
    runset: Arc<dyn RunSet>,
    runner: Arc<dyn JobRunner>,
    registry: Arc<ResourceRegistry>,
    origins: Arc<OriginLedger>,
    /// Serializes the poll tick against operator start/stop, so a UI action
    /// and the controller never work the same resource at once. Local only;
    /// cross-process exclusion is the lease store's job.
    ops: tokio::sync::Mutex<()>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        runset: Arc<dyn RunSet>,
        runner: Arc<dyn JobRunner>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let instance = InstanceId::load_or_create(&config.instance_dir)?;
        let leases = Arc::new(LeaseManager::open(&config.data_dir)?);
        let liveness = Arc::new(LivenessRegistry::open(&config.data_dir)?);
        let origins = Arc::new(OriginLedger::load(&config.instance_dir)?);
        tracing::info!(instance_id = %instance, data_dir = %config.data_dir.display(), "coordinator ready");
        Ok(Arc::new(Self {
            config,
            instance,
            leases,
            liveness,
            runset,
            runner,
            registry: Arc::new(ResourceRegistry::new()),
            origins,
            ops: tokio::sync::Mutex::new(()),
        }))
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    /// Run the poll loop and the liveness publisher until `shutdown` fires,
    /// then stop every owned job, release its lease, and mark this instance
    /// inactive.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let publisher = {
            let this = self.clone();
            let token = shutdown.clone();
            tokio::spawn(async move { this.liveness_loop(token).await })
        };

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.poll_once().await {
                // Transient by definition: the next tick retries everything.
                tracing::warn!(error = %e, "poll tick failed");
            }
        }

        let _ = publisher.await;
        self.shutdown().await;
    }

    /// Publish this instance's liveness record on a fixed interval. Publish
    /// failures are logged and retried next interval; they never affect
    /// currently-owned resources.
    async fn liveness_loop(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.liveness_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let role = self.current_role();
            if let Err(e) =
                self.liveness
                    .publish(self.instance.as_str(), role, self.config.liveness_ttl)
            {
                tracing::warn!(error = %e, "liveness publish failed");
            }
        }
    }

    /// Derived each tick, never stored: primary iff some should-run resource
    /// is one this slot originally started. A takeover holder stays
    /// secondary while covering, so its own record never reads as "the
    /// original is back".
    fn current_role(&self) -> Role {
        match self.runset.resources() {
            Ok(specs) => {
                let primary = specs
                    .iter()
                    .any(|spec| spec.running && self.origins.contains(&spec.resource_id));
                if primary {
                    Role::Primary
                } else {
                    Role::Secondary
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not derive role, reporting secondary");
                Role::Secondary
            }
        }
    }

    /// One poll tick. Public so tests can drive the controller without
    /// waiting on wall-clock intervals.
    pub async fn poll_once(&self) -> Result<()> {
        let _ops = self.ops.lock().await;
        if let Err(e) = self.leases.sweep_expired() {
            tracing::warn!(error = %e, "lease sweep failed");
        }
        if let Err(e) = self.liveness.sweep_expired() {
            tracing::warn!(error = %e, "liveness sweep failed");
        }

        self.reap_finished().await;

        let specs = self.runset.resources()?;
        let mut should_run: HashSet<&str> = HashSet::new();
        for spec in &specs {
            if spec.running {
                should_run.insert(spec.resource_id.as_str());
                self.poll_resource(spec).await;
            }
        }

        // Owned locally but no longer wanted: stop and release.
        for resource in self.registry.owned_ids() {
            if !should_run.contains(resource.as_str()) {
                tracing::info!(resource = %resource, "resource removed from running set, stopping");
                self.stop_owned(&resource, "removed from running set").await;
            }
        }
        Ok(())
    }

    async fn poll_resource(&self, spec: &ResourceSpec) {
        let resource = spec.resource_id.as_str();
        let owner = match self.leases.owner(resource) {
            Ok(owner) => owner,
            Err(e) => {
                tracing::warn!(resource = %resource, error = %e, "owner lookup failed");
                return;
            }
        };

        match owner.as_deref() {
            None => {
                if self.registry.contains(resource) {
                    // We were running it but the lease is gone: the heartbeat
                    // worker lost the race against expiry. Stop; reacquire
                    // happens on a later tick if still warranted.
                    tracing::warn!(resource = %resource, "owned locally but lease expired, stopping");
                    self.stop_owned(resource, "lease expired").await;
                    return;
                }
                let via_takeover = !self.origins.contains(resource);
                match self
                    .leases
                    .acquire(resource, self.instance.as_str(), self.config.lease_ttl)
                {
                    Ok(true) => {
                        if via_takeover {
                            tracing::info!(resource = %resource, "takeover: acquired abandoned resource");
                        } else {
                            tracing::info!(resource = %resource, "reacquired own resource");
                        }
                        self.spawn_owned(spec, via_takeover);
                    }
                    Ok(false) => {
                        tracing::debug!(resource = %resource, "lost acquire race, will monitor");
                    }
                    Err(e) => {
                        tracing::warn!(resource = %resource, error = %e, "acquire failed");
                    }
                }
            }
            Some(holder) if holder == self.instance.as_str() => {
                if !self.registry.contains(resource) {
                    // Holding a still-valid lease without local workers
                    // (e.g. a fast restart): restart them.
                    let via_takeover = !self.origins.contains(resource);
                    tracing::info!(resource = %resource, "own lease without workers, restarting job");
                    self.spawn_owned(spec, via_takeover);
                    return;
                }
                if self.registry.is_takeover(resource) == Some(true) {
                    match self
                        .liveness
                        .role_alive(Role::Primary, Some(self.instance.as_str()))
                    {
                        Ok(true) => {
                            tracing::info!(resource = %resource, "primary returned, handing back");
                            self.stop_owned(resource, "handing back to returning primary")
                                .await;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            tracing::warn!(resource = %resource, error = %e, "hand-back check failed");
                        }
                    }
                }
            }
            Some(holder) => {
                if self.registry.contains(resource) {
                    // Someone else holds a lease we thought was ours.
                    tracing::warn!(
                        resource = %resource,
                        holder = %holder,
                        "lease held elsewhere, stopping local job"
                    );
                    self.stop_owned(resource, "lease reassigned to another instance")
                        .await;
                } else {
                    tracing::debug!(resource = %resource, holder = %holder, "monitoring");
                }
            }
        }
    }

    /// Operator-initiated start on this instance: acquire first, mark this
    /// slot as the resource's origin, then flip the running flag.
    ///
    /// The resource must already be configured in the running set. A failed
    /// flag write does not surrender the lease immediately; after the retry
    /// budget the lease is released so a false "running" indicator is never
    /// left orphaned.
    pub async fn start_resource(&self, resource: &str) -> Result<()> {
        let _ops = self.ops.lock().await;
        if self.registry.contains(resource) {
            return Err(WardenError::AlreadyRunning(resource.to_string()));
        }
        let spec = self
            .runset
            .resources()?
            .into_iter()
            .find(|spec| spec.resource_id == resource)
            .ok_or_else(|| WardenError::UnknownResource(resource.to_string()))?;
        if !self
            .leases
            .acquire(resource, self.instance.as_str(), self.config.lease_ttl)?
        {
            return Err(WardenError::NotAcquired(resource.to_string()));
        }
        self.origins.mark(resource)?;

        // Register the workers before the flag goes up, so a concurrent poll
        // tick sees them and does not spawn its own.
        self.spawn_owned(&spec, false);

        let mut attempts = 0;
        loop {
            match self.runset.set_running(resource, true) {
                Ok(()) => break,
                Err(e) => {
                    attempts += 1;
                    tracing::warn!(
                        resource = %resource,
                        error = %e,
                        attempts,
                        budget = self.config.flag_write_budget,
                        "running-flag write not confirmed"
                    );
                    if attempts >= self.config.flag_write_budget {
                        self.stop_owned(resource, "running-flag write failed").await;
                        let _ = self.origins.unmark(resource);
                        return Err(e);
                    }
                    tokio::time::sleep(FLAG_WRITE_RETRY_PAUSE).await;
                }
            }
        }

        tracing::info!(resource = %resource, "resource started here");
        Ok(())
    }

    /// Operator-initiated stop: clear the flag first so no other instance
    /// takes over mid-stop, then tear down and release.
    pub async fn stop_resource(&self, resource: &str) -> Result<()> {
        let _ops = self.ops.lock().await;
        self.runset.set_running(resource, false)?;
        self.origins.unmark(resource)?;
        self.stop_owned(resource, "stopped by operator").await;
        Ok(())
    }

    fn spawn_owned(&self, spec: &ResourceSpec, via_takeover: bool) {
        let cancel = CancellationToken::new();
        let job = self
            .runner
            .start(&spec.resource_id, &spec.target, cancel.clone());
        let worker = HeartbeatWorker::new(
            spec.resource_id.clone(),
            self.instance.as_str().to_string(),
            self.leases.clone(),
            self.runset.clone(),
            self.config.heartbeat_interval(),
            self.config.lease_ttl,
            self.config.heartbeat_failure_budget,
            cancel.clone(),
        );
        let heartbeat = tokio::spawn(worker.run());
        let handle = ResourceHandle {
            cancel: cancel.clone(),
            job,
            heartbeat,
            via_takeover,
        };
        if !self.registry.insert(&spec.resource_id, handle) {
            // Lost a local race (operator action vs. poll loop); the earlier
            // workers win and these duplicates stand down.
            cancel.cancel();
        }
    }

    /// Stop local workers for a resource and attempt a holder-scoped
    /// release. The release is safe even when ownership was already lost —
    /// it never evicts a new holder.
    async fn stop_owned(&self, resource: &str, reason: &str) {
        if let Some(handle) = self.registry.remove(resource) {
            handle.cancel.cancel();
            let _ = handle.job.await;
            let _ = handle.heartbeat.await;
            tracing::info!(resource = %resource, reason, "job stopped");
        }
        match self.leases.release(resource, self.instance.as_str()) {
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(resource = %resource, error = %e, "lease release failed");
            }
        }
    }

    /// Clear registry entries whose workers exited on their own (job
    /// finished, or heartbeat worker gave up) and attempt the cleanup
    /// release for each.
    async fn reap_finished(&self) {
        for resource in self.registry.finished_ids() {
            tracing::debug!(resource = %resource, "reaping finished workers");
            self.stop_owned(&resource, "workers finished").await;
        }
    }

    async fn shutdown(&self) {
        tracing::info!(instance_id = %self.instance, "coordinator shutting down");
        for (resource, handle) in self.registry.drain() {
            handle.cancel.cancel();
            let _ = handle.job.await;
            let _ = handle.heartbeat.await;
            match self.leases.release(&resource, self.instance.as_str()) {
                Ok(_) => tracing::info!(resource = %resource, "lease released on shutdown"),
                Err(e) => {
                    tracing::warn!(resource = %resource, error = %e, "release failed on shutdown");
                }
            }
        }
        if let Err(e) = self.liveness.deactivate(self.instance.as_str()) {
            tracing::warn!(error = %e, "failed to deactivate liveness record");
        }
    }
}
