//! Outbox relay: drains pending records in bounded batches and publishes
//! each one through an external sink.
//!
//! The relay keeps no state between ticks. Attempt counting and retry
//! scheduling belong to the store.

use crate::backoff::{BackoffPolicy, ExponentialBackoff};
use crate::interfaces::{OutboxStore, Publisher, RuntimeError};
use crate::metrics;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use toolhost_infra::OutboxRecord;
use tracing::{debug, error, info, warn};

const EMPTY_CHANNEL: &str = "empty channel";

/// Per-tick outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fetched: usize,
    pub delivered: usize,
    pub failed: usize,
    pub rejected: usize,
    /// Bookkeeping calls that failed after the outcome was known.
    pub store_errors: usize,
}

pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn Publisher>,
    backoff: Arc<dyn BackoffPolicy>,
    throttle: Option<Duration>,
}

impl OutboxRelay {
    pub fn new(store: Arc<dyn OutboxStore>, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            store,
            publisher,
            backoff: Arc::new(ExponentialBackoff::default()),
            throttle: None,
        }
    }

    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Fixed pause between records of the same batch.
    pub fn with_throttle(mut self, throttle: Option<Duration>) -> Self {
        self.throttle = throttle.filter(|pause| !pause.is_zero());
        self
    }

    /// Drain up to `limit` due records, one at a time.
    ///
    /// A record's failure never aborts the batch. Only a failure to fetch
    /// the batch is returned as an error.
    pub async fn tick(&self, limit: usize) -> Result<TickReport, RuntimeError> {
        let batch = self.store.next_batch(limit).await?;
        let mut report = TickReport {
            fetched: batch.len(),
            ..TickReport::default()
        };

        for (index, record) in batch.iter().enumerate() {
            if index > 0 {
                if let Some(pause) = self.throttle {
                    tokio::time::sleep(pause).await;
                }
            }
            self.relay_one(record, &mut report).await;
        }

        if report.fetched > 0 {
            debug!(
                fetched = report.fetched,
                delivered = report.delivered,
                failed = report.failed,
                rejected = report.rejected,
                "Outbox tick complete"
            );
        }
        metrics::record_relay_tick(&report);
        Ok(report)
    }

    async fn relay_one(&self, record: &OutboxRecord, report: &mut TickReport) {
        if record.channel.is_empty() {
            warn!(record_id = %record.id, "Rejecting outbox record with empty channel");
            report.rejected += 1;
            if let Err(e) = self.store.mark_rejected(&record.id, EMPTY_CHANNEL).await {
                error!(record_id = %record.id, error = %e, "Failed to reject outbox record");
                report.store_errors += 1;
            }
            return;
        }

        match self.publisher.publish(&record.channel, &record.payload).await {
            Ok(()) => {
                report.delivered += 1;
                // Marking failed here would redeliver a record that was
                // already published; leave it pending instead.
                if let Err(e) = self.store.mark_done(&record.id).await {
                    error!(
                        record_id = %record.id,
                        error = %e,
                        "Published record could not be marked done"
                    );
                    report.store_errors += 1;
                }
                if record.attempts > 0 {
                    let pause = self.backoff.delay(record.attempts);
                    debug!(
                        record_id = %record.id,
                        attempts = record.attempts,
                        pause_ms = u64::try_from(pause.as_millis()).unwrap_or(u64::MAX),
                        "Recovered delivery, pausing"
                    );
                    tokio::time::sleep(pause).await;
                }
            }
            Err(e) => {
                warn!(
                    record_id = %record.id,
                    channel = %record.channel,
                    attempts = record.attempts,
                    error = %e,
                    "Publish failed"
                );
                report.failed += 1;
                if let Err(store_err) = self.store.mark_failed(&record.id, &e.to_string()).await {
                    error!(
                        record_id = %record.id,
                        error = %store_err,
                        "Failed to record publish failure"
                    );
                    report.store_errors += 1;
                }
            }
        }
    }

    /// Run `tick(limit)` every `interval` on a background task.
    pub fn spawn(self: Arc<Self>, interval: Duration, limit: usize) -> RelayHandle {
        let interval = interval.max(Duration::from_millis(1));
        let shutdown = Arc::new(Notify::new());
        let signal = Arc::clone(&shutdown);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
            info!(interval_ms, limit, "Outbox relay started");

            loop {
                tokio::select! {
                    biased;
                    _ = signal.notified() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick(limit).await {
                            error!(error = %e, "Outbox tick failed");
                        }
                    }
                }
            }

            info!("Outbox relay stopped");
        });

        RelayHandle { shutdown, task }
    }
}

/// Handle to a relay loop started with [`OutboxRelay::spawn`].
pub struct RelayHandle {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Stop after the tick in progress, if any, and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Outbox relay task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Owns at most one running relay loop.
pub struct RelaySupervisor {
    relay: Arc<OutboxRelay>,
    interval: Duration,
    limit: usize,
    handle: Mutex<Option<RelayHandle>>,
}

impl RelaySupervisor {
    pub fn new(relay: Arc<OutboxRelay>, interval: Duration, limit: usize) -> Self {
        Self {
            relay,
            interval,
            limit,
            handle: Mutex::new(None),
        }
    }

    pub fn relay(&self) -> &Arc<OutboxRelay> {
        &self.relay
    }

    /// Returns false if a loop is already running.
    pub fn start(&self) -> bool {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return false;
        }
        *handle = Some(Arc::clone(&self.relay).spawn(self.interval, self.limit));
        true
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    pub async fn stop(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }
}

/// Producer-side helper that appends new records to a store.
#[derive(Clone)]
pub struct Outbox {
    store: Arc<dyn OutboxStore>,
}

impl Outbox {
    pub fn new(store: Arc<dyn OutboxStore>) -> Self {
        Self { store }
    }

    /// Append a new record and return its id.
    pub async fn enqueue(
        &self,
        channel: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<String, RuntimeError> {
        let record = OutboxRecord::new(channel, payload);
        let id = record.id.clone();
        self.store.append(record).await?;
        debug!(record_id = %id, "Enqueued outbox record");
        Ok(id)
    }

    pub async fn enqueue_json<T: Serialize>(
        &self,
        channel: impl Into<String>,
        value: &T,
    ) -> Result<String, RuntimeError> {
        let payload = serde_json::to_vec(value)?;
        self.enqueue(channel, payload).await
    }

    pub fn store(&self) -> &Arc<dyn OutboxStore> {
        &self.store
    }
}
