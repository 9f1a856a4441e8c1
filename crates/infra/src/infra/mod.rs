pub mod contracts;
pub mod event_log;
pub mod outbox_store;
