//! Acquire / renew / release / inspect over the shared lease table.
//!
//! All operations are non-waiting attempts: losers of an acquire race get a
//! plain `false` and try again on their next poll tick. First
//! compare-and-swap wins; no further negotiation.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;

use crate::error::Result;
use crate::store::lease::{Lease, LeaseStore};

#[derive(Debug, Clone)]
pub struct LeaseManager {
    store: LeaseStore,
}

impl LeaseManager {
    pub fn new(store: LeaseStore) -> Self {
        Self { store }
    }

    pub fn open(dir: &Path) -> Result<Self> {
        Ok(Self {
            store: LeaseStore::open(dir)?,
        })
    }

    /// Try to claim `resource` for `holder`.
    ///
    /// Unheld or expired: swap in a fresh lease. Held by the same holder:
    /// treated as a renew — `expires_at` and `heartbeat_at` move,
    /// `acquired_at` stays. Held by anyone else: fails with no side effects.
    pub fn acquire(&self, resource: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let observed = self.store.read(resource)?;
        let now = Utc::now();
        match observed {
            Some(current) if !current.is_expired_at(now) => {
                if current.holder_id != holder {
                    return Ok(false);
                }
                let renewed = Lease {
                    expires_at: now + ttl,
                    heartbeat_at: now,
                    ..current
                };
                self.store.compare_and_swap(resource, Some(holder), renewed)
            }
            _ => self
                .store
                .compare_and_swap(resource, None, Lease::new(resource, holder, ttl)),
        }
    }

    /// Extend the lease, only while `holder` still owns it.
    ///
    /// Once the lease has expired — even if the row still exists — the renew
    /// fails. Callers must treat that as loss of ownership and stop the job,
    /// not retry indefinitely.
    pub fn renew(&self, resource: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let Some(current) = self.store.read(resource)? else {
            return Ok(false);
        };
        let now = Utc::now();
        if current.is_expired_at(now) || current.holder_id != holder {
            return Ok(false);
        }
        let renewed = Lease {
            expires_at: now + ttl,
            heartbeat_at: now,
            ..current
        };
        self.store.compare_and_swap(resource, Some(holder), renewed)
    }

    /// Drop the lease if `holder` still owns it. A lease already reassigned
    /// to someone else is left alone; releasing an unheld resource succeeds.
    pub fn release(&self, resource: &str, holder: &str) -> Result<bool> {
        self.store.delete(resource, holder)
    }

    /// Current holder, or `None` for missing and expired leases alike.
    pub fn owner(&self, resource: &str) -> Result<Option<String>> {
        Ok(self
            .store
            .read(resource)?
            .filter(|lease| !lease.is_expired())
            .map(|lease| lease.holder_id))
    }

    pub fn sweep_expired(&self) -> Result<usize> {
        self.store.sweep_expired()
    }

    pub fn snapshot(&self) -> Result<Vec<Lease>> {
        self.store.snapshot()
    }
}
