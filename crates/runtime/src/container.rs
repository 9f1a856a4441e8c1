//! Dependency container: token-keyed lazy singletons plus module start/stop
//! hooks.
//!
//! Start hooks run one at a time in module registration order. Stop hooks
//! run in exact reverse of that order, over every module that was reached
//! during start, and a failing stop hook does not prevent the rest from
//! running.

use parking_lot::Mutex;
use std::any::{type_name, Any};
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Error type returned by lifecycle hooks.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

type Instance = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(&Resolver<'_>) -> Result<Instance, ContainerError> + Send + Sync>;
type HookFuture = Pin<Box<dyn Future<Output = Result<(), HookError>> + Send>>;
type Hook = Arc<dyn Fn(Container) -> HookFuture + Send + Sync>;

/// A stop hook that failed during teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookFailure {
    pub module: String,
    pub message: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContainerError {
    #[error("no provider for token: {0}")]
    NoProvider(String),

    #[error("duplicate provider for token: {0}")]
    DuplicateProvider(String),

    #[error("cyclic dependency: {chain}")]
    CyclicDependency { chain: String },

    #[error("provider '{token}' does not produce a {expected}")]
    TypeMismatch {
        token: String,
        expected: &'static str,
    },

    #[error("provider '{token}' failed: {message}")]
    Factory { token: String, message: String },

    #[error("module '{module}' failed to start: {message}")]
    StartFailed { module: String, message: String },

    #[error("stop hooks failed: {}", describe_failures(.failures))]
    StopFailed { failures: Vec<HookFailure> },
}

impl ContainerError {
    /// Wrap a provider-specific construction error.
    pub fn factory(token: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::Factory {
            token: token.into(),
            message: error.to_string(),
        }
    }
}

fn describe_failures(failures: &[HookFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{} ({})", failure.module, failure.message))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A named factory producing one shared instance.
pub struct Provider {
    token: String,
    factory: Factory,
}

impl Provider {
    /// Provider whose instance is built on first resolution.
    ///
    /// `T` is handed out by clone, so use an `Arc` (or another shared
    /// handle) to get one instance for the container's lifetime.
    pub fn new<T, F>(token: impl Into<String>, factory: F) -> Self
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&Resolver<'_>) -> Result<T, ContainerError> + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move |resolver: &Resolver<'_>| {
            factory(resolver).map(|value| Arc::new(value) as Instance)
        });
        Self {
            token: token.into(),
            factory,
        }
    }

    /// Provider for an already-built value.
    pub fn value<T>(token: impl Into<String>, value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        Self::new(token, move |_: &Resolver<'_>| Ok(value.clone()))
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// A unit of registration: providers plus optional lifecycle hooks.
pub struct Module {
    name: String,
    providers: Vec<Provider>,
    start: Option<Hook>,
    stop: Option<Hook>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            providers: Vec::new(),
            start: None,
            stop: None,
        }
    }

    pub fn provider(mut self, provider: Provider) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn on_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Container) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HookError>> + Send + 'static,
    {
        self.start = Some(Arc::new(move |container: Container| {
            Box::pin(hook(container)) as HookFuture
        }));
        self
    }

    pub fn on_stop<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Container) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HookError>> + Send + 'static,
    {
        self.stop = Some(Arc::new(move |container: Container| {
            Box::pin(hook(container)) as HookFuture
        }));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

struct ModuleHooks {
    name: String,
    start: Option<Hook>,
    stop: Option<Hook>,
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    /// Indices of modules reached during start, in registration order.
    reached: Vec<usize>,
}

struct ContainerInner {
    providers: HashMap<String, Factory>,
    instances: Mutex<HashMap<String, Instance>>,
    modules: Vec<ModuleHooks>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

/// Shared handle to a container. Clones refer to the same instances.
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl Container {
    pub fn new(modules: Vec<Module>) -> Result<Self, ContainerError> {
        let mut providers = HashMap::new();
        let mut hooks = Vec::with_capacity(modules.len());

        for module in modules {
            for provider in module.providers {
                if providers.contains_key(&provider.token) {
                    return Err(ContainerError::DuplicateProvider(provider.token));
                }
                providers.insert(provider.token, provider.factory);
            }
            hooks.push(ModuleHooks {
                name: module.name,
                start: module.start,
                stop: module.stop,
            });
        }

        Ok(Self {
            inner: Arc::new(ContainerInner {
                providers,
                instances: Mutex::new(HashMap::new()),
                modules: hooks,
                lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
            }),
        })
    }

    /// Resolve `token`, constructing it (and its dependencies) on first use.
    pub fn resolve<T>(&self, token: &str) -> Result<T, ContainerError>
    where
        T: Clone + Send + Sync + 'static,
    {
        Resolver::new(self).resolve(token)
    }

    pub fn has_provider(&self, token: &str) -> bool {
        self.inner.providers.contains_key(token)
    }

    pub fn is_resolved(&self, token: &str) -> bool {
        self.inner.instances.lock().contains_key(token)
    }

    pub fn module_names(&self) -> Vec<String> {
        self.inner.modules.iter().map(|m| m.name.clone()).collect()
    }

    pub async fn is_started(&self) -> bool {
        self.inner.lifecycle.lock().await.started
    }

    /// Run every start hook once, in registration order.
    ///
    /// A second call is a no-op. If a hook fails, the modules already
    /// reached are stopped in reverse order and the failure is returned.
    /// Hooks must not call `start` or `stop` themselves.
    pub async fn start(&self) -> Result<(), ContainerError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.started {
            return Ok(());
        }

        for (index, module) in self.inner.modules.iter().enumerate() {
            if let Some(hook) = &module.start {
                info!(module = %module.name, "Starting module");
                if let Err(e) = hook(self.clone()).await {
                    let message = e.to_string();
                    error!(module = %module.name, error = %message, "Module failed to start");
                    let reached = std::mem::take(&mut lifecycle.reached);
                    if let Err(rollback) = self.run_stop_hooks(reached).await {
                        warn!(error = %rollback, "Rollback after failed start was incomplete");
                    }
                    return Err(ContainerError::StartFailed {
                        module: module.name.clone(),
                        message,
                    });
                }
            }
            lifecycle.reached.push(index);
        }

        lifecycle.started = true;
        info!(modules = self.inner.modules.len(), "Container started");
        Ok(())
    }

    /// Run stop hooks in reverse registration order.
    ///
    /// A second call is a no-op. Every hook runs even if an earlier one
    /// fails; all failures are reported together.
    pub async fn stop(&self) -> Result<(), ContainerError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if !lifecycle.started {
            return Ok(());
        }
        lifecycle.started = false;
        let reached = std::mem::take(&mut lifecycle.reached);
        let result = self.run_stop_hooks(reached).await;
        info!("Container stopped");
        result
    }

    async fn run_stop_hooks(&self, reached: Vec<usize>) -> Result<(), ContainerError> {
        let mut failures = Vec::new();

        for &index in reached.iter().rev() {
            let Some(module) = self.inner.modules.get(index) else {
                continue;
            };
            let Some(hook) = &module.stop else {
                continue;
            };
            info!(module = %module.name, "Stopping module");
            if let Err(e) = hook(self.clone()).await {
                error!(module = %module.name, error = %e, "Module failed to stop");
                failures.push(HookFailure {
                    module: module.name.clone(),
                    message: e.to_string(),
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ContainerError::StopFailed { failures })
        }
    }
}

/// Resolution handle passed to provider factories.
///
/// Tracks the chain of tokens being built so a provider that depends on
/// itself, directly or indirectly, fails with `CyclicDependency` instead of
/// recursing forever.
pub struct Resolver<'a> {
    container: &'a Container,
    stack: RefCell<Vec<String>>,
}

impl<'a> Resolver<'a> {
    fn new(container: &'a Container) -> Self {
        Self {
            container,
            stack: RefCell::new(Vec::new()),
        }
    }

    pub fn resolve<T>(&self, token: &str) -> Result<T, ContainerError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let instance = self.resolve_instance(token)?;
        instance
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| ContainerError::TypeMismatch {
                token: token.to_string(),
                expected: type_name::<T>(),
            })
    }

    fn resolve_instance(&self, token: &str) -> Result<Instance, ContainerError> {
        let inner = &self.container.inner;
        if let Some(instance) = inner.instances.lock().get(token) {
            return Ok(Arc::clone(instance));
        }

        let factory = inner
            .providers
            .get(token)
            .cloned()
            .ok_or_else(|| ContainerError::NoProvider(token.to_string()))?;

        {
            let mut stack = self.stack.borrow_mut();
            if stack.iter().any(|pending| pending == token) {
                let mut chain = stack.clone();
                chain.push(token.to_string());
                return Err(ContainerError::CyclicDependency {
                    chain: chain.join(" -> "),
                });
            }
            stack.push(token.to_string());
        }

        let created = factory(self);
        self.stack.borrow_mut().pop();
        let created = created?;

        // Another caller may have finished first; keep the earlier instance.
        let mut instances = inner.instances.lock();
        let instance = instances
            .entry(token.to_string())
            .or_insert(created);
        debug!(token, "Provider resolved");
        Ok(Arc::clone(instance))
    }
}
