use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use toolhost_infra::*;
use toolhost_tools::Clock;

struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(Utc::now())))
    }

    fn advance(&self, by: ChronoDuration) {
        let mut now = self.0.lock();
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock()
    }
}

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(60),
    }
}

#[test]
fn test_next_batch_is_oldest_first_and_bounded() {
    let store = SqliteOutboxStore::in_memory().unwrap();
    let mut ids = Vec::new();
    for i in 0..5 {
        let mut record = OutboxRecord::new("events", vec![i]);
        record.created_at = Utc::now() - ChronoDuration::seconds(10 - i64::from(i));
        ids.push(record.id.clone());
        store.append(&record).unwrap();
    }

    let batch = store.next_batch(3).unwrap();
    let got: Vec<String> = batch.iter().map(|r| r.id.clone()).collect();
    assert_eq!(got, ids[..3].to_vec());
    assert_eq!(batch[0].payload, vec![0]);
}

#[test]
fn test_done_records_are_never_redelivered() {
    let store = SqliteOutboxStore::in_memory().unwrap();
    let record = OutboxRecord::new("events", b"hello".to_vec());
    store.append(&record).unwrap();

    store.mark_done(&record.id).unwrap();

    assert!(store.next_batch(10).unwrap().is_empty());
    assert_eq!(store.status(&record.id).unwrap(), Some(OutboxStatus::Done));
    assert!(matches!(
        store.mark_done(&record.id),
        Err(OutboxStoreError::NotPending(_))
    ));
    assert!(matches!(
        store.mark_failed(&record.id, "late"),
        Err(OutboxStoreError::NotPending(_))
    ));
}

#[test]
fn test_failed_record_waits_for_backoff_then_returns() {
    let clock = ManualClock::new();
    let store = SqliteOutboxStore::in_memory()
        .unwrap()
        .with_clock(clock.clone())
        .with_retry_policy(policy(5));
    let record = OutboxRecord::new("events", b"x".to_vec());
    store.append(&record).unwrap();

    store.mark_failed(&record.id, "sink down").unwrap();
    assert!(store.next_batch(10).unwrap().is_empty());

    clock.advance(ChronoDuration::milliseconds(1001));
    let batch = store.next_batch(10).unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].attempts, 1);

    store.mark_failed(&record.id, "sink down").unwrap();
    clock.advance(ChronoDuration::milliseconds(1500));
    assert!(store.next_batch(10).unwrap().is_empty());
    clock.advance(ChronoDuration::milliseconds(600));
    assert_eq!(store.next_batch(10).unwrap()[0].attempts, 2);
}

#[test]
fn test_record_dies_after_max_attempts() {
    let clock = ManualClock::new();
    let store = SqliteOutboxStore::in_memory()
        .unwrap()
        .with_clock(clock.clone())
        .with_retry_policy(policy(2));
    let record = OutboxRecord::new("events", b"x".to_vec());
    store.append(&record).unwrap();

    store.mark_failed(&record.id, "first").unwrap();
    clock.advance(ChronoDuration::seconds(5));
    store.mark_failed(&record.id, "second").unwrap();
    clock.advance(ChronoDuration::seconds(120));

    assert!(store.next_batch(10).unwrap().is_empty());
    assert_eq!(store.status(&record.id).unwrap(), Some(OutboxStatus::Dead));
    let dead = store.dead_letters(10).unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].record.attempts, 2);
    assert_eq!(dead[0].last_error.as_deref(), Some("second"));
}

#[test]
fn test_rejected_record_is_parked_immediately() {
    let store = SqliteOutboxStore::in_memory().unwrap();
    let record = OutboxRecord::new("", b"x".to_vec());
    store.append(&record).unwrap();

    store.mark_rejected(&record.id, "empty channel").unwrap();

    assert_eq!(store.pending_count().unwrap(), 0);
    assert_eq!(store.status(&record.id).unwrap(), Some(OutboxStatus::Dead));
}

#[test]
fn test_pending_records_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("outbox.db");
    let pending = OutboxRecord::new("events", b"keep".to_vec());
    let done = OutboxRecord::new("events", b"gone".to_vec());
    {
        let store = SqliteOutboxStore::new(&path).unwrap();
        store.append(&pending).unwrap();
        store.append(&done).unwrap();
        store.mark_done(&done.id).unwrap();
    }

    let store = SqliteOutboxStore::new(&path).unwrap();
    let batch = store.next_batch(10).unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, pending.id);
    assert_eq!(batch[0].payload, b"keep".to_vec());
    assert_eq!(batch[0].created_at.timestamp_millis(), pending.created_at.timestamp_millis());
}

#[test]
fn test_purge_done_removes_only_old_delivered_records() {
    let store = SqliteOutboxStore::in_memory().unwrap();
    let done = OutboxRecord::new("events", b"a".to_vec());
    let pending = OutboxRecord::new("events", b"b".to_vec());
    store.append(&done).unwrap();
    store.append(&pending).unwrap();
    store.mark_done(&done.id).unwrap();

    let removed = store.purge_done(Utc::now() + ChronoDuration::seconds(1)).unwrap();

    assert_eq!(removed, 1);
    assert_eq!(store.status(&done.id).unwrap(), None);
    assert_eq!(store.pending_count().unwrap(), 1);
}
