//! Runtime configuration loader.

use crate::backoff::ExponentialBackoff;
use crate::interfaces::RuntimeError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Semaphore;
use toolhost_infra::RetryPolicy;

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub workspace_root: PathBuf,
    pub outbox_path: PathBuf,
    pub events_log: Option<PathBuf>,
    pub log_filter: String,
    pub max_concurrent_requests: usize,
    pub dispatcher: DispatcherConfig,
    pub relay: RelayConfig,
    pub store: StoreConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            outbox_path: PathBuf::from("data/outbox.db"),
            events_log: None,
            log_filter: "info".to_string(),
            max_concurrent_requests: 64,
            dispatcher: DispatcherConfig::default(),
            relay: RelayConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherConfig {
    /// Deadline applied to requests that do not carry their own.
    pub default_timeout_ms: Option<u64>,
    /// Emit `tool.notfound` for unregistered names.
    pub emit_not_found: bool,
}

impl DispatcherConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    pub batch_limit: usize,
    pub interval_ms: u64,
    /// Pause between records of one batch.
    pub throttle_ms: Option<u64>,
    pub backoff: BackoffConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_limit: 50,
            interval_ms: 1000,
            throttle_ms: None,
            backoff: BackoffConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn throttle(&self) -> Option<Duration> {
        self.throttle_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub factor: f64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 100,
            factor: 2.0,
            max_ms: 30_000,
        }
    }
}

impl BackoffConfig {
    pub fn policy(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.base_ms),
            self.factor,
            Duration::from_millis(self.max_ms),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            retry_base_ms: 500,
            retry_max_ms: 300_000,
        }
    }
}

impl StoreConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
        }
    }
}

impl RuntimeConfig {
    /// Check values serde cannot.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.max_concurrent_requests == 0 {
            return Err(RuntimeError::ConfigError(
                "max_concurrent_requests must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_requests > Semaphore::MAX_PERMITS {
            return Err(RuntimeError::ConfigError(format!(
                "max_concurrent_requests must be at most {}, got {}",
                Semaphore::MAX_PERMITS,
                self.max_concurrent_requests
            )));
        }
        if self.relay.batch_limit == 0 {
            return Err(RuntimeError::ConfigError(
                "relay.batch_limit must be at least 1".to_string(),
            ));
        }
        if self.relay.interval_ms == 0 {
            return Err(RuntimeError::ConfigError(
                "relay.interval_ms must be at least 1".to_string(),
            ));
        }
        let factor = self.relay.backoff.factor;
        if factor.is_nan() || factor < 1.0 {
            return Err(RuntimeError::ConfigError(format!(
                "relay.backoff.factor must be >= 1, got {}",
                factor
            )));
        }
        if self.store.max_attempts == 0 {
            return Err(RuntimeError::ConfigError(
                "store.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Install the global tracing subscriber using `log_filter` as the
    /// default directive. See [`crate::telemetry::init_tracing`].
    pub fn init_tracing(&self) -> bool {
        crate::telemetry::init_tracing(&self.log_filter)
    }

    fn resolve_paths(&mut self, base: &Path) {
        self.workspace_root = resolve(base, &self.workspace_root);
        self.outbox_path = resolve(base, &self.outbox_path);
        self.events_log = self.events_log.as_deref().map(|path| resolve(base, path));
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Load runtime configuration from a YAML file.
///
/// Missing keys take their defaults. Relative paths are resolved against
/// the directory containing the config file.
///
/// # Errors
/// Returns `ConfigError` if the file is missing, empty, not valid YAML, or
/// fails validation.
pub fn load_runtime_config<P: AsRef<Path>>(config_path: P) -> Result<RuntimeConfig, RuntimeError> {
    let config_file = config_path.as_ref();

    if !config_file.exists() {
        return Err(RuntimeError::ConfigError(format!(
            "Config file not found: {}",
            config_file.display()
        )));
    }

    let content = std::fs::read_to_string(config_file)?;

    if content.trim().is_empty() {
        return Err(RuntimeError::ConfigError("Config file is empty".to_string()));
    }

    let mut config: RuntimeConfig = serde_yaml::from_str(&content)
        .map_err(|e| RuntimeError::ConfigError(format!("Invalid YAML: {}", e)))?;

    config.validate()?;

    let base = config_file.parent().unwrap_or_else(|| Path::new("."));
    config.resolve_paths(base);
    Ok(config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.relay.backoff.policy(), ExponentialBackoff::default());
        assert_eq!(config.store.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_nan_factor_rejected() {
        let mut config = RuntimeConfig::default();
        config.relay.backoff.factor = f64::NAN;
        assert!(matches!(config.validate(), Err(RuntimeError::ConfigError(_))));
    }

    #[test]
    fn test_concurrency_limit_capped_by_semaphore() {
        let mut config = RuntimeConfig::default();
        config.max_concurrent_requests = Semaphore::MAX_PERMITS;
        assert!(config.validate().is_ok());

        config.max_concurrent_requests = usize::MAX;
        assert!(matches!(config.validate(), Err(RuntimeError::ConfigError(_))));
    }
}
