//! The instance liveness table.
//!
//! Independent of per-resource leases: every instance publishes its own
//! record each heartbeat interval, whether or not it holds anything. The
//! only question this table answers is "is some original primary still out
//! there" — takeover decisions never consult it.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::TableFile;

const INSTANCES_TABLE: &str = "instances";

/// Role an instance reports for itself. Derived, not assigned: an instance
/// is primary while some should-run resource is one it originally started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Secondary,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => f.write_str("primary"),
            Role::Secondary => f.write_str("secondary"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessRecord {
    pub instance_id: String,
    pub role: Role,
    pub heartbeat_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
}

impl LivenessRecord {
    /// An inactive or expired record means "this instance is not alive",
    /// regardless of what else it says.
    pub fn is_alive_at(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at > now
    }

    pub fn is_alive(&self) -> bool {
        self.is_alive_at(Utc::now())
    }
}

/// Shared registry of instance heartbeats.
#[derive(Debug, Clone)]
pub struct LivenessRegistry {
    table: TableFile,
}

impl LivenessRegistry {
    pub fn open(dir: &Path) -> Result<Self> {
        Ok(Self {
            table: TableFile::new(dir, INSTANCES_TABLE)?,
        })
    }

    /// Upsert this instance's own record. Called once per heartbeat interval.
    pub fn publish(&self, instance_id: &str, role: Role, ttl: Duration) -> Result<()> {
        let now = Utc::now();
        let record = LivenessRecord {
            instance_id: instance_id.to_string(),
            role,
            heartbeat_at: now,
            expires_at: now + ttl,
            active: true,
        };
        self.table
            .update(|table: &mut HashMap<String, LivenessRecord>| {
                table.insert(instance_id.to_string(), record);
            })
    }

    /// Mark this instance's record inactive on graceful shutdown.
    pub fn deactivate(&self, instance_id: &str) -> Result<()> {
        self.table
            .update(|table: &mut HashMap<String, LivenessRecord>| {
                if let Some(record) = table.get_mut(instance_id) {
                    record.active = false;
                }
            })
    }

    /// True iff some alive record carries `role`, skipping `exclude` so a
    /// takeover holder never counts its own publication.
    pub fn role_alive(&self, role: Role, exclude: Option<&str>) -> Result<bool> {
        let now = Utc::now();
        let table = self.table.read::<LivenessRecord>()?;
        Ok(table.values().any(|record| {
            record.role == role
                && record.is_alive_at(now)
                && Some(record.instance_id.as_str()) != exclude
        }))
    }

    /// Reclaim expired records. Space hygiene only; readers already ignore
    /// them.
    pub fn sweep_expired(&self) -> Result<usize> {
        self.table
            .update(|table: &mut HashMap<String, LivenessRecord>| {
                let now = Utc::now();
                let before = table.len();
                table.retain(|_, record| record.expires_at > now);
                before - table.len()
            })
    }

    /// All records, sorted by instance id.
    pub fn snapshot(&self) -> Result<Vec<LivenessRecord>> {
        let mut rows: Vec<LivenessRecord> =
            self.table.read::<LivenessRecord>()?.into_values().collect();
        rows.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> (TempDir, LivenessRegistry) {
        let dir = TempDir::new().unwrap();
        let registry = LivenessRegistry::open(dir.path()).unwrap();
        (dir, registry)
    }

    #[test]
    fn published_primary_is_seen_alive() {
        let (_dir, registry) = registry();
        registry
            .publish("i1", Role::Primary, Duration::from_secs(20))
            .unwrap();
        assert!(registry.role_alive(Role::Primary, None).unwrap());
        assert!(!registry.role_alive(Role::Secondary, None).unwrap());
    }

    #[test]
    fn exclusion_hides_own_record() {
        let (_dir, registry) = registry();
        registry
            .publish("i1", Role::Primary, Duration::from_secs(20))
            .unwrap();
        assert!(!registry.role_alive(Role::Primary, Some("i1")).unwrap());
        registry
            .publish("i2", Role::Primary, Duration::from_secs(20))
            .unwrap();
        assert!(registry.role_alive(Role::Primary, Some("i1")).unwrap());
    }

    #[test]
    fn expired_or_inactive_records_are_not_alive() {
        let (_dir, registry) = registry();
        registry.publish("i1", Role::Primary, Duration::ZERO).unwrap();
        assert!(!registry.role_alive(Role::Primary, None).unwrap());

        registry
            .publish("i2", Role::Primary, Duration::from_secs(20))
            .unwrap();
        registry.deactivate("i2").unwrap();
        assert!(!registry.role_alive(Role::Primary, None).unwrap());
    }

    #[test]
    fn republish_overwrites_role_and_extends_expiry() {
        let (_dir, registry) = registry();
        registry
            .publish("i1", Role::Secondary, Duration::from_secs(20))
            .unwrap();
        registry
            .publish("i1", Role::Primary, Duration::from_secs(20))
            .unwrap();
        let rows = registry.snapshot().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].role, Role::Primary);
    }

    #[test]
    fn sweep_reclaims_expired_records() {
        let (_dir, registry) = registry();
        registry.publish("i1", Role::Secondary, Duration::ZERO).unwrap();
        registry
            .publish("i2", Role::Secondary, Duration::from_secs(20))
            .unwrap();
        assert_eq!(registry.sweep_expired().unwrap(), 1);
        assert_eq!(registry.snapshot().unwrap().len(), 1);
    }
}
