//! The running set: the configuration layer's view of which resources
//! should have their automation running.
//!
//! The coordination core consumes this read-mostly: it may toggle the
//! running flag and append to the per-resource log mailbox, nothing else.
//! Entries themselves (targets, additions, removals) belong to the
//! configuration layer — here represented by [`FileRunSet`]'s inherent
//! `upsert`/`remove` methods, which the CLI uses.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::TableFile;

const RUNSET_TABLE: &str = "runset";
const LOGS_TABLE: &str = "logs";

/// Log lines kept per resource. Older lines are dropped first, so a takeover
/// instance still sees the recent transcript.
const LOG_CAP: usize = 1000;

/// One configured resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub resource_id: String,
    /// Whether the automation should currently be running somewhere.
    pub running: bool,
    /// Opaque descriptor handed to the job runner (e.g. the command line or
    /// target account).
    pub target: String,
}

/// Interface the coordination core sees.
pub trait RunSet: Send + Sync {
    /// Every configured entry, running or not.
    fn resources(&self) -> Result<Vec<ResourceSpec>>;

    /// Toggle the running flag. Unknown resources are ignored.
    fn set_running(&self, resource: &str, running: bool) -> Result<()>;

    /// Append lines to the resource's log mailbox.
    fn append_log(&self, resource: &str, lines: &[String]) -> Result<()>;

    fn read_log(&self, resource: &str) -> Result<Vec<String>>;
}

/// Running set stored in the shared table files, next to the leases.
#[derive(Debug, Clone)]
pub struct FileRunSet {
    entries: TableFile,
    logs: TableFile,
}

impl FileRunSet {
    pub fn open(dir: &Path) -> Result<Self> {
        Ok(Self {
            entries: TableFile::new(dir, RUNSET_TABLE)?,
            logs: TableFile::new(dir, LOGS_TABLE)?,
        })
    }

    /// Configuration-layer write: add or replace an entry.
    pub fn upsert(&self, spec: ResourceSpec) -> Result<()> {
        self.entries
            .update(|table: &mut HashMap<String, ResourceSpec>| {
                table.insert(spec.resource_id.clone(), spec);
            })
    }

    /// Configuration-layer write: drop an entry and its log.
    pub fn remove(&self, resource: &str) -> Result<()> {
        self.entries
            .update(|table: &mut HashMap<String, ResourceSpec>| {
                table.remove(resource);
            })?;
        self.logs.update(|table: &mut HashMap<String, Vec<String>>| {
            table.remove(resource);
        })
    }
}

impl RunSet for FileRunSet {
    fn resources(&self) -> Result<Vec<ResourceSpec>> {
        let mut specs: Vec<ResourceSpec> = self
            .entries
            .read::<ResourceSpec>()?
            .into_values()
            .collect();
        specs.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        Ok(specs)
    }

    fn set_running(&self, resource: &str, running: bool) -> Result<()> {
        self.entries
            .update(|table: &mut HashMap<String, ResourceSpec>| {
                if let Some(spec) = table.get_mut(resource) {
                    spec.running = running;
                }
            })
    }

    fn append_log(&self, resource: &str, lines: &[String]) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        self.logs.update(|table: &mut HashMap<String, Vec<String>>| {
            let log = table.entry(resource.to_string()).or_default();
            log.extend(lines.iter().cloned());
            if log.len() > LOG_CAP {
                let excess = log.len() - LOG_CAP;
                log.drain(..excess);
            }
        })
    }

    fn read_log(&self, resource: &str) -> Result<Vec<String>> {
        Ok(self
            .logs
            .read::<Vec<String>>()?
            .remove(resource)
            .unwrap_or_default())
    }
}
