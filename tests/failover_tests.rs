//! Failover tests: takeover after a crashed holder, acquire races between
//! instances, heartbeat behavior, and operator start/stop.

mod test_harness;

use std::time::Duration;

use test_harness::{assert_eventually, TestBed, TestInstance};
use warden::error::WardenError;
use warden::RunSet;
use warden::store::lease::{Lease, LeaseStore};

/// A crashed holder stops renewing; another instance must take over within
/// the TTL plus a poll interval.
#[tokio::test]
async fn takeover_after_holder_crash() {
    let bed = TestBed::new();
    bed.configure("u1", true);

    let slot1 = bed.slot();
    let i1 = TestInstance::start(&bed, slot1.path());
    assert_eventually(
        || async { i1.runner.is_active("u1") },
        Duration::from_secs(2),
        "first instance should start the job",
    )
    .await;
    let i1_id = i1.id();
    assert_eq!(bed.owner("u1").as_deref(), Some(i1_id.as_str()));

    i1.crash();

    let slot2 = bed.slot();
    let i2 = TestInstance::start(&bed, slot2.path());
    assert_eventually(
        || async { i2.runner.is_active("u1") },
        Duration::from_secs(3),
        "second instance should take over after the lease expires",
    )
    .await;
    assert_eq!(bed.owner("u1"), Some(i2.id()));
    assert_ne!(i1_id, i2.id());

    // The dead holder's late release must not evict the new one.
    assert!(!bed.leases().release("u1", &i1_id).unwrap());
    assert_eq!(bed.owner("u1"), Some(i2.id()));

    i2.shutdown().await;
}

/// Two instances racing for a fresh resource: exactly one starts the job.
#[tokio::test]
async fn acquire_race_has_a_single_winner() {
    let bed = TestBed::new();
    bed.configure("u1", true);

    let slot1 = bed.slot();
    let slot2 = bed.slot();
    let i1 = TestInstance::start(&bed, slot1.path());
    let i2 = TestInstance::start(&bed, slot2.path());

    assert_eventually(
        || async { i1.runner.is_active("u1") || i2.runner.is_active("u1") },
        Duration::from_secs(2),
        "someone should win the acquire race",
    )
    .await;

    // Let several poll ticks and lease renewals pass.
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(
        i1.runner.starts("u1") + i2.runner.starts("u1"),
        1,
        "the job must have been started exactly once"
    );
    assert!(
        i1.runner.is_active("u1") ^ i2.runner.is_active("u1"),
        "exactly one instance should be running the job"
    );

    i1.shutdown().await;
    i2.shutdown().await;
}

/// The heartbeat worker keeps the lease alive well past its TTL without any
/// restart of the job.
#[tokio::test]
async fn heartbeat_keeps_lease_beyond_ttl() {
    let bed = TestBed::new();
    bed.configure("u1", true);

    let slot = bed.slot();
    let i1 = TestInstance::start(&bed, slot.path());
    assert_eventually(
        || async { i1.runner.is_active("u1") },
        Duration::from_secs(2),
        "job should start",
    )
    .await;

    // Four lease TTLs.
    tokio::time::sleep(Duration::from_millis(1200)).await;

    assert!(i1.runner.is_active("u1"));
    assert_eq!(i1.runner.starts("u1"), 1);
    assert_eq!(bed.owner("u1"), Some(i1.id()));

    i1.shutdown().await;
}

/// Clearing the running flag stops the job and releases the lease within a
/// poll interval.
#[tokio::test]
async fn clearing_running_flag_stops_and_releases() {
    let bed = TestBed::new();
    bed.configure("u1", true);

    let slot = bed.slot();
    let i1 = TestInstance::start(&bed, slot.path());
    assert_eventually(
        || async { i1.runner.is_active("u1") },
        Duration::from_secs(2),
        "job should start",
    )
    .await;

    bed.runset().set_running("u1", false).unwrap();

    assert_eventually(
        || async { !i1.runner.is_active("u1") && bed.owner("u1").is_none() },
        Duration::from_secs(2),
        "job should stop and the lease should be released",
    )
    .await;
    // Released, not merely expired: the row is gone.
    assert!(bed.leases().snapshot().unwrap().is_empty());

    i1.shutdown().await;
}

/// A holder whose lease is confirmed reassigned stops its job immediately
/// but leaves the running flag alone — the flag now belongs to the usurper.
#[tokio::test]
async fn lost_lease_stops_job_without_clearing_flag() {
    let bed = TestBed::new();
    bed.configure("u1", true);

    let slot = bed.slot();
    let i1 = TestInstance::start(&bed, slot.path());
    assert_eventually(
        || async { i1.runner.is_active("u1") },
        Duration::from_secs(2),
        "job should start",
    )
    .await;

    // Swap the lease to a different holder behind i1's back.
    let i1_id = i1.id();
    let store = LeaseStore::open(bed.data.path()).unwrap();
    assert!(store
        .compare_and_swap(
            "u1",
            Some(i1_id.as_str()),
            Lease::new("u1", "intruder", Duration::from_secs(30)),
        )
        .unwrap());

    assert_eventually(
        || async { !i1.runner.is_active("u1") },
        Duration::from_secs(2),
        "losing the lease must stop the local job",
    )
    .await;
    assert_eq!(bed.owner("u1").as_deref(), Some("intruder"));
    let specs = bed.runset().resources().unwrap();
    assert!(specs[0].running, "the running flag belongs to the new holder");

    i1.shutdown().await;
}

/// Operator start: duplicate starts, foreign leases, and unknown resources
/// are all rejected with distinct errors.
#[tokio::test]
async fn start_resource_rejections() {
    let bed = TestBed::new();
    bed.configure("u1", false);
    bed.configure("u2", false);

    let slot = bed.slot();
    let i1 = TestInstance::start(&bed, slot.path());

    i1.coordinator.start_resource("u1").await.unwrap();
    assert!(i1.runner.is_active("u1"));
    assert!(matches!(
        i1.coordinator.start_resource("u1").await,
        Err(WardenError::AlreadyRunning(_))
    ));

    bed.leases()
        .acquire("u2", "someone-else", Duration::from_secs(30))
        .unwrap();
    assert!(matches!(
        i1.coordinator.start_resource("u2").await,
        Err(WardenError::NotAcquired(_))
    ));

    assert!(matches!(
        i1.coordinator.start_resource("ghost").await,
        Err(WardenError::UnknownResource(_))
    ));

    i1.shutdown().await;
}

/// Operator stop clears the flag, stops the job, and releases the lease.
#[tokio::test]
async fn stop_resource_clears_flag_and_releases() {
    let bed = TestBed::new();
    bed.configure("u1", false);

    let slot = bed.slot();
    let i1 = TestInstance::start(&bed, slot.path());
    i1.coordinator.start_resource("u1").await.unwrap();

    i1.coordinator.stop_resource("u1").await.unwrap();

    assert!(!i1.runner.is_active("u1"));
    assert!(bed.owner("u1").is_none());
    let specs = bed.runset().resources().unwrap();
    assert!(!specs[0].running);

    i1.shutdown().await;
}

/// Graceful shutdown releases leases immediately (no TTL wait) and marks the
/// liveness record inactive, so a standby picks the resource up within a
/// poll interval instead of a full TTL.
#[tokio::test]
async fn graceful_shutdown_releases_for_fast_pickup() {
    let bed = TestBed::new();
    bed.configure("u1", true);

    let slot1 = bed.slot();
    let i1 = TestInstance::start(&bed, slot1.path());
    assert_eventually(
        || async { i1.runner.is_active("u1") },
        Duration::from_secs(2),
        "job should start",
    )
    .await;
    let i1_id = i1.id();

    i1.shutdown().await;

    assert!(bed.owner("u1").is_none());
    let records = bed.liveness().snapshot().unwrap();
    let own = records.iter().find(|r| r.instance_id == i1_id).unwrap();
    assert!(!own.active);

    // The flag stays set: the resource should still run somewhere.
    assert!(bed.runset().resources().unwrap()[0].running);

    let slot2 = bed.slot();
    let i2 = TestInstance::start(&bed, slot2.path());
    assert_eventually(
        || async { i2.runner.is_active("u1") },
        Duration::from_secs(2),
        "standby should pick the released resource up",
    )
    .await;

    i2.shutdown().await;
}
