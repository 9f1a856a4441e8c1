//! Runtime host - assembles the container and exposes the single
//! request/response entry point to transports.

use crate::async_adapters::AsyncOutboxStore;
use crate::container::{Container, ContainerError, HookError, Module, Provider, Resolver};
use crate::interfaces::{OutboxStore, Publisher, RuntimeError};
use crate::metrics::MetricsSink;
use crate::outbox_relay::{Outbox, OutboxRelay, RelaySupervisor};
use crate::publishers::StrategyPublisher;
use crate::runtime_config::RuntimeConfig;
use crate::strategy::{Strategy, StrategyDeps, StrategyDispatcher, StrategyRegistry};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use toolhost_infra::{JsonlEventLog, SqliteOutboxStore};
use toolhost_tools::{
    EventSink, ObservabilityBus, ToolDefinition, ToolDispatcher, ToolRegistry, ToolRequest,
    ToolResponse,
};
use tracing::{info, warn};

/// Provider tokens registered by the built-in modules.
pub mod tokens {
    pub const CONFIG: &str = "config";
    pub const OUTBOX_STORE: &str = "outbox.store";
    pub const OUTBOX: &str = "outbox";
    pub const EVENT_LOG: &str = "observability.event_log";
    pub const EVENT_BUS: &str = "observability.bus";
    pub const TOOL_DISPATCHER: &str = "tools.dispatcher";
    pub const STRATEGY_DISPATCHER: &str = "strategies.dispatcher";
    pub const RELAY: &str = "relay.supervisor";
}

/// Collects tools, strategies and collaborators before the host is frozen.
pub struct RuntimeHostBuilder {
    config: RuntimeConfig,
    tools: Vec<ToolDefinition>,
    strategies: Vec<Arc<dyn Strategy>>,
    publisher: Option<Arc<dyn Publisher>>,
    sinks: Vec<Arc<dyn EventSink>>,
    outbox_store: Option<Arc<dyn OutboxStore>>,
    modules: Vec<Module>,
}

impl RuntimeHostBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            tools: Vec::new(),
            strategies: Vec::new(),
            publisher: None,
            sinks: Vec::new(),
            outbox_store: None,
            modules: Vec::new(),
        }
    }

    pub fn tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn strategy(mut self, strategy: Arc<dyn Strategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// External sink for outbox records. Defaults to routing records to the
    /// strategy owning their channel.
    pub fn publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Use `store` instead of opening the SQLite outbox at `outbox_path`.
    pub fn outbox_store(mut self, store: Arc<dyn OutboxStore>) -> Self {
        self.outbox_store = Some(store);
        self
    }

    /// Extra module; starts after the built-in ones and stops before them.
    pub fn module(mut self, module: Module) -> Self {
        self.modules.push(module);
        self
    }

    pub fn build(self) -> Result<RuntimeHost, RuntimeError> {
        self.config.validate()?;

        let mut tools = ToolRegistry::new();
        for tool in self.tools {
            tools.register(tool)?;
        }
        let mut strategies = StrategyRegistry::new();
        for strategy in self.strategies {
            strategies.register(strategy)?;
        }

        let config = Arc::new(self.config);
        let mut modules = vec![
            storage_module(Arc::clone(&config), self.outbox_store),
            observability_module(Arc::clone(&config), self.sinks),
            tools_module(Arc::clone(&config), Arc::new(tools), Arc::new(strategies)),
            relay_module(Arc::clone(&config), self.publisher),
        ];
        modules.extend(self.modules);

        let container = Container::new(modules)?;
        Ok(RuntimeHost {
            container,
            limiter: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            config,
            serving: AtomicBool::new(false),
        })
    }
}

fn storage_module(config: Arc<RuntimeConfig>, injected: Option<Arc<dyn OutboxStore>>) -> Module {
    let store = match injected {
        Some(store) => Provider::value(tokens::OUTBOX_STORE, store),
        None => {
            let config = Arc::clone(&config);
            Provider::new(tokens::OUTBOX_STORE, move |_: &Resolver<'_>| {
                let sqlite = SqliteOutboxStore::new(&config.outbox_path)
                    .map_err(|e| ContainerError::factory(tokens::OUTBOX_STORE, e))?
                    .with_retry_policy(config.store.retry_policy());
                info!(path = %config.outbox_path.display(), "Outbox store opened");
                Ok(Arc::new(AsyncOutboxStore::new(Arc::new(sqlite))) as Arc<dyn OutboxStore>)
            })
        }
    };

    Module::new("storage")
        .provider(Provider::value(tokens::CONFIG, config))
        .provider(store)
        .provider(Provider::new(tokens::OUTBOX, |r: &Resolver<'_>| {
            Ok(Outbox::new(r.resolve::<Arc<dyn OutboxStore>>(tokens::OUTBOX_STORE)?))
        }))
        .on_start(|container: Container| async move {
            // Open storage now so a bad path fails startup, not the first write.
            container.resolve::<Arc<dyn OutboxStore>>(tokens::OUTBOX_STORE)?;
            Ok::<(), HookError>(())
        })
}

fn observability_module(config: Arc<RuntimeConfig>, sinks: Vec<Arc<dyn EventSink>>) -> Module {
    Module::new("observability")
        .provider(Provider::new(tokens::EVENT_LOG, move |_: &Resolver<'_>| {
            match &config.events_log {
                Some(path) => JsonlEventLog::new(path)
                    .map(Some)
                    .map_err(|e| ContainerError::factory(tokens::EVENT_LOG, e)),
                None => Ok(None::<Arc<JsonlEventLog>>),
            }
        }))
        .provider(Provider::new(tokens::EVENT_BUS, move |r: &Resolver<'_>| {
            let mut bus = ObservabilityBus::new().with_sink(Arc::new(MetricsSink));
            if let Some(log) = r.resolve::<Option<Arc<JsonlEventLog>>>(tokens::EVENT_LOG)? {
                bus.subscribe(log);
            }
            for sink in &sinks {
                bus.subscribe(Arc::clone(sink));
            }
            Ok(bus)
        }))
        .on_stop(|container: Container| async move {
            if container.is_resolved(tokens::EVENT_LOG) {
                let log = container.resolve::<Option<Arc<JsonlEventLog>>>(tokens::EVENT_LOG)?;
                if let Some(log) = log {
                    tokio::task::spawn_blocking(move || log.close()).await?;
                }
            }
            Ok::<(), HookError>(())
        })
}

fn tools_module(
    config: Arc<RuntimeConfig>,
    tools: Arc<ToolRegistry>,
    strategies: Arc<StrategyRegistry>,
) -> Module {
    Module::new("tools")
        .provider(Provider::new(tokens::TOOL_DISPATCHER, move |r: &Resolver<'_>| {
            let bus = r.resolve::<ObservabilityBus>(tokens::EVENT_BUS)?;
            let dispatcher =
                ToolDispatcher::new(Arc::clone(&tools), bus, config.workspace_root.clone())
                    .with_default_timeout(config.dispatcher.default_timeout())
                    .with_not_found_events(config.dispatcher.emit_not_found);
            Ok(Arc::new(dispatcher))
        }))
        .provider(Provider::new(tokens::STRATEGY_DISPATCHER, move |r: &Resolver<'_>| {
            let bus = r.resolve::<ObservabilityBus>(tokens::EVENT_BUS)?;
            let store = r.resolve::<Arc<dyn OutboxStore>>(tokens::OUTBOX_STORE)?;
            let deps = StrategyDeps::new().with_outbox(store);
            Ok(Arc::new(
                StrategyDispatcher::new(Arc::clone(&strategies), deps).with_bus(bus),
            ))
        }))
        .on_start(|container: Container| async move {
            let tools = container.resolve::<Arc<ToolDispatcher>>(tokens::TOOL_DISPATCHER)?;
            let strategies =
                container.resolve::<Arc<StrategyDispatcher>>(tokens::STRATEGY_DISPATCHER)?;
            info!(
                tools = tools.registry().count(),
                strategies = strategies.registry().count(),
                "Handlers ready"
            );
            Ok::<(), HookError>(())
        })
}

fn relay_module(config: Arc<RuntimeConfig>, publisher: Option<Arc<dyn Publisher>>) -> Module {
    Module::new("relay")
        .provider(Provider::new(tokens::RELAY, move |r: &Resolver<'_>| {
            let store = r.resolve::<Arc<dyn OutboxStore>>(tokens::OUTBOX_STORE)?;
            let publisher = match &publisher {
                Some(publisher) => Arc::clone(publisher),
                None => {
                    let strategies =
                        r.resolve::<Arc<StrategyDispatcher>>(tokens::STRATEGY_DISPATCHER)?;
                    Arc::new(StrategyPublisher::new(strategies)) as Arc<dyn Publisher>
                }
            };
            let relay = OutboxRelay::new(store, publisher)
                .with_backoff(Arc::new(config.relay.backoff.policy()))
                .with_throttle(config.relay.throttle());
            Ok(Arc::new(RelaySupervisor::new(
                Arc::new(relay),
                config.relay.interval(),
                config.relay.batch_limit,
            )))
        }))
        .on_start(|container: Container| async move {
            let relay = container.resolve::<Arc<RelaySupervisor>>(tokens::RELAY)?;
            relay.start();
            Ok::<(), HookError>(())
        })
        .on_stop(|container: Container| async move {
            let relay = container.resolve::<Arc<RelaySupervisor>>(tokens::RELAY)?;
            relay.stop().await;
            Ok::<(), HookError>(())
        })
}

/// A started host serves tool requests and relays the outbox in the
/// background until stopped.
///
/// Requests are refused outside the window between a successful `start`
/// and the next `stop`.
pub struct RuntimeHost {
    container: Container,
    config: Arc<RuntimeConfig>,
    limiter: Arc<Semaphore>,
    serving: AtomicBool,
}

impl RuntimeHost {
    pub fn builder(config: RuntimeConfig) -> RuntimeHostBuilder {
        RuntimeHostBuilder::new(config)
    }

    /// Host with the given tools and strategies. Without a publisher,
    /// outbox records are routed to strategies by channel.
    pub fn build(
        config: RuntimeConfig,
        tools: Vec<ToolDefinition>,
        strategies: Vec<Arc<dyn Strategy>>,
        publisher: Option<Arc<dyn Publisher>>,
    ) -> Result<Self, RuntimeError> {
        let mut builder = RuntimeHostBuilder::new(config);
        builder.tools = tools;
        builder.strategies = strategies;
        builder.publisher = publisher;
        builder.build()
    }

    /// Run every module's start hook. A failure here is fatal: the host
    /// must not serve requests.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        self.container.start().await?;
        self.serving.store(true, Ordering::SeqCst);
        info!(modules = ?self.container.module_names(), "Runtime started");
        Ok(())
    }

    /// Transport entry point. Never fails; every problem becomes an
    /// error response.
    pub async fn handle(&self, request: ToolRequest) -> ToolResponse {
        if !self.is_serving() {
            warn!(tool = %request.name, "Request refused, runtime not started");
            return ToolResponse::error(RuntimeError::NotStarted.to_string());
        }
        let _permit = match self.limiter.acquire().await {
            Ok(permit) => permit,
            Err(e) => return ToolResponse::error(format!("Runtime unavailable: {}", e)),
        };

        match self.container.resolve::<Arc<ToolDispatcher>>(tokens::TOOL_DISPATCHER) {
            Ok(dispatcher) => dispatcher.handle(request).await,
            Err(e) => {
                warn!(tool = %request.name, error = %e, "Dispatcher unavailable");
                ToolResponse::error(format!("Runtime unavailable: {}", e))
            }
        }
    }

    /// Route a message to the strategy owning `topic`.
    pub async fn dispatch_message(&self, topic: &str, message: Value) -> Result<(), RuntimeError> {
        if !self.is_serving() {
            return Err(RuntimeError::NotStarted);
        }
        let dispatcher = self
            .container
            .resolve::<Arc<StrategyDispatcher>>(tokens::STRATEGY_DISPATCHER)?;
        dispatcher.dispatch(topic, message).await?;
        Ok(())
    }

    pub fn outbox(&self) -> Result<Outbox, RuntimeError> {
        Ok(self.container.resolve::<Outbox>(tokens::OUTBOX)?)
    }

    pub fn relay(&self) -> Result<Arc<RelaySupervisor>, RuntimeError> {
        Ok(self.container.resolve::<Arc<RelaySupervisor>>(tokens::RELAY)?)
    }

    /// Function-style schema listing of every registered tool.
    pub fn tool_schemas(&self) -> Result<Vec<Value>, RuntimeError> {
        let dispatcher = self
            .container
            .resolve::<Arc<ToolDispatcher>>(tokens::TOOL_DISPATCHER)?;
        Ok(dispatcher.registry().schemas())
    }

    pub async fn stop(&self) -> Result<(), RuntimeError> {
        self.serving.store(false, Ordering::SeqCst);
        self.container.stop().await?;
        info!("Runtime stopped");
        Ok(())
    }

    /// True between a successful `start` and the next `stop`.
    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn container(&self) -> &Container {
        &self.container
    }
}
