//! Slot-local identity: a stable instance id plus the origin ledger.
//!
//! Both files live in the instance directory, not the shared store, so they
//! survive process restarts within the same deployment slot without being
//! visible to other slots.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use uuid::Uuid;

use crate::error::Result;

const INSTANCE_ID_FILE: &str = "instance.id";
const ORIGIN_FILE: &str = "origins.json";

/// Stable identifier for a running deployment slot.
///
/// Generated once, persisted, and reused across restarts so a returning
/// instance is recognizable as the same holder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceId(String);

impl InstanceId {
    /// Load the persisted id for this slot, creating one on first start.
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        let path = dir.join(INSTANCE_ID_FILE);
        if let Ok(contents) = fs::read_to_string(&path) {
            let id = contents.trim();
            if !id.is_empty() {
                return Ok(Self(id.to_string()));
            }
        }
        let id = Uuid::new_v4().to_string();
        fs::create_dir_all(dir)?;
        fs::write(&path, &id)?;
        tracing::info!(instance_id = %id, "generated new instance id");
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted set of resources this slot originally started (as opposed to
/// took over). Membership drives the role this instance publishes and
/// whether a poll-loop acquisition counts as a takeover.
///
/// Slot-local only; guarded by a mutex against concurrent local callers.
#[derive(Debug)]
pub struct OriginLedger {
    path: PathBuf,
    set: Mutex<HashSet<String>>,
}

impl OriginLedger {
    pub fn load(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(ORIGIN_FILE);
        let set = match fs::read(&path) {
            Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes)?,
            Ok(_) => HashSet::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            set: Mutex::new(set),
        })
    }

    pub fn mark(&self, resource: &str) -> Result<()> {
        let mut set = self.set.lock().expect("origin ledger mutex poisoned");
        if set.insert(resource.to_string()) {
            self.persist(&set)?;
        }
        Ok(())
    }

    pub fn unmark(&self, resource: &str) -> Result<()> {
        let mut set = self.set.lock().expect("origin ledger mutex poisoned");
        if set.remove(resource) {
            self.persist(&set)?;
        }
        Ok(())
    }

    pub fn contains(&self, resource: &str) -> bool {
        self.set
            .lock()
            .expect("origin ledger mutex poisoned")
            .contains(resource)
    }

    fn persist(&self, set: &HashSet<String>) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(set)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
