//! Toolhost runtime core
//!
//! Wires tools, strategies and the outbox relay together behind a dependency
//! container with ordered start/stop hooks.

pub mod async_adapters;
pub mod backoff;
pub mod container;
pub mod interfaces;
pub mod metrics;
pub mod outbox_relay;
pub mod publishers;
pub mod runtime_config;
pub mod runtime_controller;
pub mod strategy;
pub mod telemetry;

pub use async_adapters::{AsyncOutboxStore, InMemoryOutboxStore};
pub use backoff::{backoff_fn, BackoffPolicy, ExponentialBackoff, FnBackoff, NoBackoff};
pub use container::{Container, ContainerError, HookError, HookFailure, Module, Provider, Resolver};
pub use interfaces::{OutboxStore, PublishError, Publisher, RuntimeError};
pub use metrics::MetricsSink;
pub use outbox_relay::{Outbox, OutboxRelay, RelayHandle, RelaySupervisor, TickReport};
pub use publishers::StrategyPublisher;
pub use runtime_config::{load_runtime_config, RuntimeConfig};
pub use runtime_controller::{tokens, RuntimeHost, RuntimeHostBuilder};
pub use strategy::{Strategy, StrategyDeps, StrategyDispatcher, StrategyError, StrategyRegistry};
pub use telemetry::init_tracing;
pub use toolhost_infra::{OutboxRecord, OutboxStatus};
