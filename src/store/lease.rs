//! The lease table: one row per protected resource.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::TableFile;

const LEASES_TABLE: &str = "leases";

/// A time-bounded exclusive claim on a resource.
///
/// A row whose `expires_at` has passed is treated as unheld by every reader,
/// whether or not it has been physically swept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub resource_id: String,
    pub holder_id: String,
    /// Set on first acquisition by the current holder; renewal keeps it.
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Last successful renewal. Informational.
    pub heartbeat_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(resource_id: &str, holder_id: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            resource_id: resource_id.to_string(),
            holder_id: holder_id.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
            heartbeat_at: now,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Atomic operations over the shared lease table.
///
/// Every operation holds the table's cross-process lock for its whole
/// read-modify-write cycle, so concurrent callers in unrelated processes
/// observe each other's writes in full or not at all.
#[derive(Debug, Clone)]
pub struct LeaseStore {
    table: TableFile,
}

impl LeaseStore {
    pub fn open(dir: &Path) -> Result<Self> {
        Ok(Self {
            table: TableFile::new(dir, LEASES_TABLE)?,
        })
    }

    /// Replace the row for `resource` only if the current holder matches
    /// `expected` (an expired row counts as no holder). Returns whether the
    /// swap happened.
    pub fn compare_and_swap(
        &self,
        resource: &str,
        expected: Option<&str>,
        new: Lease,
    ) -> Result<bool> {
        self.table.update(|table: &mut HashMap<String, Lease>| {
            let now = Utc::now();
            let current = table
                .get(resource)
                .filter(|lease| !lease.is_expired_at(now))
                .map(|lease| lease.holder_id.as_str());
            if current != expected {
                return false;
            }
            table.insert(resource.to_string(), new);
            true
        })
    }

    pub fn read(&self, resource: &str) -> Result<Option<Lease>> {
        Ok(self.table.read::<Lease>()?.remove(resource))
    }

    /// Remove the row only if the current unexpired holder is
    /// `expected_holder`. Deleting an absent or already-expired row is a
    /// no-op success; a row reassigned to someone else is left untouched.
    pub fn delete(&self, resource: &str, expected_holder: &str) -> Result<bool> {
        self.table.update(|table: &mut HashMap<String, Lease>| {
            let now = Utc::now();
            let held_by_us = match table.get(resource) {
                None => return true,
                Some(lease) if lease.is_expired_at(now) => return true,
                Some(lease) => lease.holder_id == expected_holder,
            };
            if held_by_us {
                table.remove(resource);
            }
            held_by_us
        })
    }

    /// Garbage-collect expired rows. Idempotent and safe to call from every
    /// instance on every tick.
    pub fn sweep_expired(&self) -> Result<usize> {
        self.table.update(|table: &mut HashMap<String, Lease>| {
            let now = Utc::now();
            let before = table.len();
            table.retain(|_, lease| !lease.is_expired_at(now));
            before - table.len()
        })
    }

    /// All rows, expired included, sorted by resource id.
    pub fn snapshot(&self) -> Result<Vec<Lease>> {
        let mut rows: Vec<Lease> = self.table.read::<Lease>()?.into_values().collect();
        rows.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, LeaseStore) {
        let dir = TempDir::new().unwrap();
        let store = LeaseStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn cas_from_none_succeeds_once() {
        let (_dir, store) = store();
        let ttl = Duration::from_secs(60);
        assert!(store
            .compare_and_swap("u1", None, Lease::new("u1", "a", ttl))
            .unwrap());
        assert!(!store
            .compare_and_swap("u1", None, Lease::new("u1", "b", ttl))
            .unwrap());
        assert_eq!(store.read("u1").unwrap().unwrap().holder_id, "a");
    }

    #[test]
    fn cas_treats_expired_row_as_unheld() {
        let (_dir, store) = store();
        assert!(store
            .compare_and_swap("u1", None, Lease::new("u1", "a", Duration::ZERO))
            .unwrap());
        assert!(store
            .compare_and_swap("u1", None, Lease::new("u1", "b", Duration::from_secs(60)))
            .unwrap());
        assert_eq!(store.read("u1").unwrap().unwrap().holder_id, "b");
    }

    #[test]
    fn delete_is_holder_scoped() {
        let (_dir, store) = store();
        let ttl = Duration::from_secs(60);
        store
            .compare_and_swap("u1", None, Lease::new("u1", "a", ttl))
            .unwrap();
        assert!(!store.delete("u1", "b").unwrap());
        assert!(store.read("u1").unwrap().is_some());
        assert!(store.delete("u1", "a").unwrap());
        assert!(store.read("u1").unwrap().is_none());
    }

    #[test]
    fn delete_of_absent_or_expired_row_is_noop_success() {
        let (_dir, store) = store();
        assert!(store.delete("missing", "a").unwrap());
        store
            .compare_and_swap("u1", None, Lease::new("u1", "a", Duration::ZERO))
            .unwrap();
        assert!(store.delete("u1", "b").unwrap());
    }

    #[test]
    fn sweep_removes_only_expired_rows() {
        let (_dir, store) = store();
        store
            .compare_and_swap("old", None, Lease::new("old", "a", Duration::ZERO))
            .unwrap();
        store
            .compare_and_swap("live", None, Lease::new("live", "a", Duration::from_secs(60)))
            .unwrap();
        assert_eq!(store.sweep_expired().unwrap(), 1);
        assert!(store.read("old").unwrap().is_none());
        assert!(store.read("live").unwrap().is_some());
        assert_eq!(store.sweep_expired().unwrap(), 0);
    }
}
