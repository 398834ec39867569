//! Test harness for multi-instance failover integration tests.
//!
//! Provides a shared store directory, per-slot instance directories, a mock
//! job runner that records starts and cancellations, and wait helpers.

// Each integration test binary uses its own subset of the harness.
#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use warden::config::CoordinatorConfig;
use warden::coordinator::Coordinator;
use warden::lease::LeaseManager;
use warden::runner::JobRunner;
use warden::runset::{FileRunSet, ResourceSpec, RunSet};
use warden::store::liveness::LivenessRegistry;

/// Coordinator timings shortened for fast tests.
pub fn test_config(data_dir: &Path, instance_dir: &Path) -> CoordinatorConfig {
    CoordinatorConfig::new(data_dir)
        .with_instance_dir(instance_dir)
        .with_lease_ttl(Duration::from_millis(300))
        .with_poll_interval(Duration::from_millis(75))
        .with_liveness(Duration::from_millis(60), Duration::from_millis(250))
}

#[derive(Debug, Default)]
struct JobState {
    starts: usize,
    active: bool,
}

/// Job runner that records starts and goes inactive on cancellation,
/// without running anything real.
#[derive(Debug, Clone, Default)]
pub struct MockRunner {
    state: Arc<Mutex<HashMap<String, JobState>>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times a job was started for this resource.
    pub fn starts(&self, resource: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .get(resource)
            .map(|s| s.starts)
            .unwrap_or(0)
    }

    /// Whether a job for this resource is currently running.
    pub fn is_active(&self, resource: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .get(resource)
            .map(|s| s.active)
            .unwrap_or(false)
    }
}

impl JobRunner for MockRunner {
    fn start(&self, resource: &str, _target: &str, cancel: CancellationToken) -> JoinHandle<()> {
        {
            let mut state = self.state.lock().unwrap();
            let entry = state.entry(resource.to_string()).or_default();
            entry.starts += 1;
            entry.active = true;
        }
        let state = self.state.clone();
        let resource = resource.to_string();
        tokio::spawn(async move {
            cancel.cancelled().await;
            if let Some(entry) = state.lock().unwrap().get_mut(&resource) {
                entry.active = false;
            }
        })
    }
}

/// Shared store directory plus handles to inspect it from the outside,
/// the way an operator or another process would.
pub struct TestBed {
    pub data: TempDir,
}

impl TestBed {
    pub fn new() -> Self {
        Self {
            data: TempDir::new().unwrap(),
        }
    }

    /// Fresh per-instance directory (identity and origin ledger live here).
    pub fn slot(&self) -> TempDir {
        TempDir::new().unwrap()
    }

    pub fn runset(&self) -> FileRunSet {
        FileRunSet::open(self.data.path()).unwrap()
    }

    pub fn leases(&self) -> LeaseManager {
        LeaseManager::open(self.data.path()).unwrap()
    }

    pub fn liveness(&self) -> LivenessRegistry {
        LivenessRegistry::open(self.data.path()).unwrap()
    }

    /// Put a resource in the running set.
    pub fn configure(&self, resource: &str, running: bool) {
        self.runset()
            .upsert(ResourceSpec {
                resource_id: resource.to_string(),
                running,
                target: format!("job-for-{resource}"),
            })
            .unwrap();
    }

    pub fn owner(&self, resource: &str) -> Option<String> {
        self.leases().owner(resource).unwrap()
    }
}

/// One coordinator instance with its poll loop running.
pub struct TestInstance {
    pub coordinator: Arc<Coordinator>,
    pub runner: MockRunner,
    shutdown: CancellationToken,
    run_handle: JoinHandle<()>,
}

impl TestInstance {
    pub fn start(bed: &TestBed, slot: &Path) -> Self {
        let config = test_config(bed.data.path(), slot);
        let runset: Arc<dyn RunSet> = Arc::new(FileRunSet::open(bed.data.path()).unwrap());
        let runner = MockRunner::new();
        let coordinator = Coordinator::new(config, runset, Arc::new(runner.clone())).unwrap();
        let shutdown = CancellationToken::new();
        let run_handle = tokio::spawn(coordinator.clone().run(shutdown.clone()));
        Self {
            coordinator,
            runner,
            shutdown,
            run_handle,
        }
    }

    pub fn id(&self) -> String {
        self.coordinator.instance_id().as_str().to_string()
    }

    /// Simulate process death: every task dies immediately, nothing is
    /// released or deactivated. Leases and the liveness record linger
    /// until they expire.
    pub fn crash(self) {
        self.run_handle.abort();
        self.shutdown.cancel();
        for (_, handle) in self.coordinator.registry().drain() {
            handle.job.abort();
            handle.heartbeat.abort();
        }
    }

    /// Graceful shutdown: releases held leases and deactivates liveness.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.run_handle.await;
    }
}

/// Wait for a condition to become true with timeout.
pub async fn wait_for<F, Fut>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Assert a condition eventually becomes true.
pub async fn assert_eventually<F, Fut>(condition: F, timeout: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout).await;
    assert!(result, "{}", message);
}
