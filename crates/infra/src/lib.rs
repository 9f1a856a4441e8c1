//! Disk-durable storage behind the runtime: the SQLite outbox and the
//! append-only event log.

pub mod infra;

pub use infra::contracts::{DeadLetter, OutboxRecord, OutboxStatus};
pub use infra::event_log::{EventLogError, JsonlEventLog};
pub use infra::outbox_store::{OutboxStoreError, RetryPolicy, SqliteOutboxStore};
