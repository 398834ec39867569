//! Lease-based failover coordination for singleton background automations.
//!
//! Every resource that must run as exactly one process cluster-wide is
//! guarded by a lease in a shared store. Instances run a [`Coordinator`]
//! that acquires leases for resources it should run, heartbeats them while
//! the job lives, and takes over resources whose leases have expired. A
//! takeover holder hands the resource back once its original instance
//! reports itself alive again.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod identity;
pub mod lease;
pub mod runner;
pub mod runset;
pub mod shutdown;
pub mod store;

pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use error::{Result, WardenError};
pub use identity::{InstanceId, OriginLedger};
pub use lease::LeaseManager;
pub use runner::{CommandRunner, JobRunner};
pub use runset::{FileRunSet, ResourceSpec, RunSet};
pub use store::lease::{Lease, LeaseStore};
pub use store::liveness::{LivenessRecord, LivenessRegistry, Role};
