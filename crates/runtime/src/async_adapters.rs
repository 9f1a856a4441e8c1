use crate::interfaces::{OutboxStore, RuntimeError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use toolhost_infra::{DeadLetter, OutboxRecord, OutboxStatus, SqliteOutboxStore};

fn store_error(e: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::StoreError(e.to_string())
}

/// Async wrapper for the sync SQLite outbox store
#[derive(Clone)]
pub struct AsyncOutboxStore {
    inner: Arc<SqliteOutboxStore>,
}

impl AsyncOutboxStore {
    pub fn new(inner: Arc<SqliteOutboxStore>) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &Arc<SqliteOutboxStore> {
        &self.inner
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, RuntimeError>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteOutboxStore) -> Result<T, toolhost_infra::OutboxStoreError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(inner.as_ref()).map_err(store_error))
            .await
            .map_err(store_error)?
    }

    pub async fn status(&self, id: &str) -> Result<Option<OutboxStatus>, RuntimeError> {
        let id = id.to_string();
        self.blocking(move |store| store.status(&id)).await
    }

    pub async fn pending_count(&self) -> Result<usize, RuntimeError> {
        self.blocking(|store| store.pending_count()).await
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, RuntimeError> {
        self.blocking(move |store| store.dead_letters(limit)).await
    }

    pub async fn purge_done(&self, cutoff: DateTime<Utc>) -> Result<usize, RuntimeError> {
        self.blocking(move |store| store.purge_done(cutoff)).await
    }
}

#[async_trait]
impl OutboxStore for AsyncOutboxStore {
    async fn append(&self, record: OutboxRecord) -> Result<(), RuntimeError> {
        self.blocking(move |store| store.append(&record)).await
    }

    async fn next_batch(&self, limit: usize) -> Result<Vec<OutboxRecord>, RuntimeError> {
        self.blocking(move |store| store.next_batch(limit)).await
    }

    async fn mark_done(&self, id: &str) -> Result<(), RuntimeError> {
        let id = id.to_string();
        self.blocking(move |store| store.mark_done(&id)).await
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), RuntimeError> {
        let id = id.to_string();
        let error = error.to_string();
        self.blocking(move |store| store.mark_failed(&id, &error)).await
    }

    async fn mark_rejected(&self, id: &str, error: &str) -> Result<(), RuntimeError> {
        let id = id.to_string();
        let error = error.to_string();
        self.blocking(move |store| store.mark_rejected(&id, &error)).await
    }
}

struct Entry {
    record: OutboxRecord,
    status: OutboxStatus,
    last_error: Option<String>,
}

/// Non-durable outbox for tests and development. Failed records are due
/// again immediately.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    entries: Mutex<Vec<Entry>>,
    failures: Mutex<Vec<(String, String)>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, id: &str) -> Option<OutboxStatus> {
        self.entries
            .lock()
            .iter()
            .find(|entry| entry.record.id == id)
            .map(|entry| entry.status)
    }

    pub fn pending(&self) -> Vec<OutboxRecord> {
        self.with_status(OutboxStatus::Pending)
    }

    pub fn done(&self) -> Vec<OutboxRecord> {
        self.with_status(OutboxStatus::Done)
    }

    pub fn dead(&self) -> Vec<DeadLetter> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.status == OutboxStatus::Dead)
            .map(|entry| DeadLetter {
                record: entry.record.clone(),
                last_error: entry.last_error.clone(),
            })
            .collect()
    }

    /// Every `mark_failed` call as `(id, error)`, in call order.
    pub fn failures(&self) -> Vec<(String, String)> {
        self.failures.lock().clone()
    }

    fn with_status(&self, status: OutboxStatus) -> Vec<OutboxRecord> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.record.clone())
            .collect()
    }

    fn update<F>(&self, id: &str, f: F) -> Result<(), RuntimeError>
    where
        F: FnOnce(&mut Entry),
    {
        let mut entries = self.entries.lock();
        let entry = entries
            .iter_mut()
            .find(|entry| entry.record.id == id)
            .ok_or_else(|| RuntimeError::StoreError(format!("Unknown outbox record: {}", id)))?;
        if entry.status != OutboxStatus::Pending {
            return Err(RuntimeError::StoreError(format!(
                "Outbox record not pending: {}",
                id
            )));
        }
        f(entry);
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn append(&self, record: OutboxRecord) -> Result<(), RuntimeError> {
        let mut entries = self.entries.lock();
        if entries.iter().any(|entry| entry.record.id == record.id) {
            return Err(RuntimeError::StoreError(format!(
                "Duplicate outbox record: {}",
                record.id
            )));
        }
        entries.push(Entry {
            record,
            status: OutboxStatus::Pending,
            last_error: None,
        });
        Ok(())
    }

    async fn next_batch(&self, limit: usize) -> Result<Vec<OutboxRecord>, RuntimeError> {
        let entries = self.entries.lock();
        let mut batch: Vec<OutboxRecord> = entries
            .iter()
            .filter(|entry| entry.status == OutboxStatus::Pending)
            .map(|entry| entry.record.clone())
            .collect();
        // Stable sort keeps append order among equal timestamps.
        batch.sort_by_key(|record| record.created_at);
        batch.truncate(limit);
        Ok(batch)
    }

    async fn mark_done(&self, id: &str) -> Result<(), RuntimeError> {
        self.update(id, |entry| entry.status = OutboxStatus::Done)
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), RuntimeError> {
        self.update(id, |entry| {
            entry.record.attempts += 1;
            entry.last_error = Some(error.to_string());
        })?;
        self.failures.lock().push((id.to_string(), error.to_string()));
        Ok(())
    }

    async fn mark_rejected(&self, id: &str, error: &str) -> Result<(), RuntimeError> {
        self.update(id, |entry| {
            entry.status = OutboxStatus::Dead;
            entry.last_error = Some(error.to_string());
        })
    }
}
