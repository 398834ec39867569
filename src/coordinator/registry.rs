//! Process-local bookkeeping of resources this instance currently runs.
//!
//! One explicit registry object per process, passed to whoever needs it;
//! its mutex guards against concurrent local callers (an operator action
//! and the poll loop racing to start the same resource). It has no bearing
//! on cross-process correctness — that lives in the lease store.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Workers attached to one owned resource.
#[derive(Debug)]
pub struct ResourceHandle {
    /// Shared stop signal for the job and its heartbeat worker.
    pub cancel: CancellationToken,
    pub job: JoinHandle<()>,
    pub heartbeat: JoinHandle<()>,
    /// Whether the lease behind this handle was acquired by takeover.
    pub via_takeover: bool,
}

#[derive(Debug, Default)]
pub struct ResourceRegistry {
    inner: Mutex<HashMap<String, ResourceHandle>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register workers for a resource. Returns `false` (leaving the
    /// existing entry untouched) if the resource is already running locally.
    pub fn insert(&self, resource: &str, handle: ResourceHandle) -> bool {
        let mut inner = self.inner.lock().expect("resource registry mutex poisoned");
        if inner.contains_key(resource) {
            return false;
        }
        inner.insert(resource.to_string(), handle);
        true
    }

    pub fn remove(&self, resource: &str) -> Option<ResourceHandle> {
        self.inner
            .lock()
            .expect("resource registry mutex poisoned")
            .remove(resource)
    }

    pub fn contains(&self, resource: &str) -> bool {
        self.inner
            .lock()
            .expect("resource registry mutex poisoned")
            .contains_key(resource)
    }

    pub fn is_takeover(&self, resource: &str) -> Option<bool> {
        self.inner
            .lock()
            .expect("resource registry mutex poisoned")
            .get(resource)
            .map(|handle| handle.via_takeover)
    }

    pub fn owned_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("resource registry mutex poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Resources whose workers have already exited on their own.
    pub fn finished_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("resource registry mutex poisoned")
            .iter()
            .filter(|(_, handle)| handle.job.is_finished() || handle.heartbeat.is_finished())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Take everything, for shutdown.
    pub fn drain(&self) -> Vec<(String, ResourceHandle)> {
        self.inner
            .lock()
            .expect("resource registry mutex poisoned")
            .drain()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .expect("resource registry mutex poisoned")
            .is_empty()
    }
}
