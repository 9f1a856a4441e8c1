use crate::infra::contracts::{DeadLetter, OutboxRecord, OutboxStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use toolhost_tools::{Clock, SystemClock};
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum OutboxStoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Duplicate outbox record: {0}")]
    Duplicate(String),
    #[error("Outbox record not pending: {0}")]
    NotPending(String),
}

/// Per-record retry schedule applied by `mark_failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after which a record is parked as dead.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before a record that has failed `attempts` times is eligible again.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1_u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS outbox (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        channel TEXT NOT NULL,
        payload BLOB NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        created_at_ms INTEGER NOT NULL,
        next_attempt_ms INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        last_error TEXT,
        updated_at_ms INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_outbox_pending ON outbox(status, next_attempt_ms, created_at_ms);
";

/// Durable outbox backed by SQLite in WAL mode.
///
/// Each state transition is a single statement or transaction, so after a
/// crash a record is pending, done or dead; never lost and never handed out
/// again once done.
pub struct SqliteOutboxStore {
    conn: Mutex<Connection>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl SqliteOutboxStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, OutboxStoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")?;
        Self::with_connection(conn)
    }

    /// Non-durable store for tests.
    pub fn in_memory() -> Result<Self, OutboxStoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, OutboxStoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            retry: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    pub fn append(&self, record: &OutboxRecord) -> Result<(), OutboxStoreError> {
        let now = self.now_ms();
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT INTO outbox (id, channel, payload, attempts, created_at_ms, next_attempt_ms, status, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?6)",
            params![
                record.id,
                record.channel,
                record.payload,
                record.attempts,
                record.created_at.timestamp_millis(),
                now
            ],
        );
        match inserted {
            Ok(_) => {
                debug!(record_id = %record.id, channel = %record.channel, "Outbox record appended");
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(OutboxStoreError::Duplicate(record.id.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Pending records whose retry time has come, oldest first.
    pub fn next_batch(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxStoreError> {
        let now = self.now_ms();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, channel, payload, attempts, created_at_ms FROM outbox
             WHERE status = 'pending' AND next_attempt_ms <= ?1
             ORDER BY created_at_ms, seq
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![now, limit], record_from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn mark_done(&self, id: &str) -> Result<(), OutboxStoreError> {
        let now = self.now_ms();
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE outbox SET status = 'done', last_error = NULL, updated_at_ms = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, now],
        )?;
        if updated == 0 {
            return Err(OutboxStoreError::NotPending(id.to_string()));
        }
        Ok(())
    }

    /// Count one failed attempt and schedule the next, or park the record as
    /// dead once `max_attempts` is reached.
    pub fn mark_failed(&self, id: &str, error: &str) -> Result<(), OutboxStoreError> {
        let now = self.now_ms();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let attempts: Option<u32> = tx
            .query_row(
                "SELECT attempts FROM outbox WHERE id = ?1 AND status = 'pending'",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(attempts) = attempts else {
            return Err(OutboxStoreError::NotPending(id.to_string()));
        };

        let attempts = attempts.saturating_add(1);
        if attempts >= self.retry.max_attempts {
            tx.execute(
                "UPDATE outbox SET attempts = ?2, status = 'dead', last_error = ?3, updated_at_ms = ?4
                 WHERE id = ?1",
                params![id, attempts, error, now],
            )?;
            warn!(record_id = %id, attempts, error = %error, "Outbox record exhausted its retries");
        } else {
            let delay = i64::try_from(self.retry.delay_for(attempts).as_millis()).unwrap_or(i64::MAX);
            tx.execute(
                "UPDATE outbox SET attempts = ?2, last_error = ?3, next_attempt_ms = ?4, updated_at_ms = ?5
                 WHERE id = ?1",
                params![id, attempts, error, now.saturating_add(delay), now],
            )?;
            debug!(record_id = %id, attempts, retry_in_ms = delay, "Outbox record scheduled for retry");
        }

        tx.commit()?;
        Ok(())
    }

    /// Park a record that can never be delivered; it is not retried.
    pub fn mark_rejected(&self, id: &str, error: &str) -> Result<(), OutboxStoreError> {
        let now = self.now_ms();
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE outbox SET status = 'dead', attempts = attempts + 1, last_error = ?2, updated_at_ms = ?3
             WHERE id = ?1 AND status = 'pending'",
            params![id, error, now],
        )?;
        if updated == 0 {
            return Err(OutboxStoreError::NotPending(id.to_string()));
        }
        Ok(())
    }

    pub fn status(&self, id: &str) -> Result<Option<OutboxStatus>, OutboxStoreError> {
        let conn = self.conn.lock();
        let status: Option<String> = conn
            .query_row("SELECT status FROM outbox WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        Ok(status.as_deref().and_then(OutboxStatus::parse))
    }

    pub fn pending_count(&self) -> Result<usize, OutboxStoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM outbox WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    pub fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, OutboxStoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, channel, payload, attempts, created_at_ms, last_error FROM outbox
             WHERE status = 'dead'
             ORDER BY updated_at_ms DESC, seq DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(DeadLetter {
                record: record_from_row(row)?,
                last_error: row.get(5)?,
            })
        })?;

        let mut letters = Vec::new();
        for row in rows {
            letters.push(row?);
        }
        Ok(letters)
    }

    /// Delete delivered records last touched before `cutoff`.
    pub fn purge_done(&self, cutoff: DateTime<Utc>) -> Result<usize, OutboxStoreError> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM outbox WHERE status = 'done' AND updated_at_ms < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        Ok(removed)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<OutboxRecord> {
    let created_at_ms: i64 = row.get(4)?;
    let created_at = DateTime::<Utc>::from_timestamp_millis(created_at_ms)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(4, created_at_ms))?;
    Ok(OutboxRecord {
        id: row.get(0)?,
        channel: row.get(1)?,
        payload: row.get(2)?,
        attempts: row.get(3)?,
        created_at,
    })
}
