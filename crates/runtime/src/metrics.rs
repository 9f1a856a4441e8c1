//! Metrics instrumentation for the dispatcher and outbox relay.

use crate::outbox_relay::TickReport;
use toolhost_tools::{EventSink, ObservabilityEvent};

/// Record tool execution latency.
pub fn record_tool_latency(tool: &str, duration_ms: u64) {
    metrics::histogram!("tool_execution_latency", duration_ms as f64, "tool" => tool.to_string());
}

/// Increment the per-tool call counter for `outcome`.
pub fn increment_tool_calls(tool: &str, outcome: &'static str) {
    metrics::counter!("tool_calls_total", 1, "tool" => tool.to_string(), "outcome" => outcome);
}

/// Record strategy handling latency.
pub fn record_strategy_latency(topic: &str, duration_ms: u64) {
    metrics::histogram!("strategy_latency", duration_ms as f64, "topic" => topic.to_string());
}

/// Add a relay tick's outcome counts.
pub fn record_relay_tick(report: &TickReport) {
    metrics::counter!("outbox_delivered_total", report.delivered as u64);
    metrics::counter!("outbox_failed_total", report.failed as u64);
    metrics::counter!("outbox_rejected_total", report.rejected as u64);
    metrics::counter!("outbox_store_errors_total", report.store_errors as u64);
    metrics::histogram!("outbox_batch_size", report.fetched as f64);
}

/// Install a Prometheus recorder for the process. Scrape it by calling
/// `render()` on the returned handle; serving the text is up to the host.
#[cfg(feature = "prometheus")]
pub fn install_prometheus_recorder(
) -> Result<metrics_exporter_prometheus::PrometheusHandle, crate::interfaces::RuntimeError> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| crate::interfaces::RuntimeError::ConfigError(format!("Metrics recorder: {}", e)))
}

/// Observability sink that turns events into counters and histograms.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsSink;

impl EventSink for MetricsSink {
    fn on_event(&self, event: &ObservabilityEvent) {
        match event {
            ObservabilityEvent::Start { .. } | ObservabilityEvent::StrategyStart { .. } => {}
            ObservabilityEvent::Success {
                tool, duration_ms, ..
            } => {
                record_tool_latency(tool, *duration_ms);
                increment_tool_calls(tool, "success");
            }
            ObservabilityEvent::Error {
                tool, duration_ms, ..
            } => {
                record_tool_latency(tool, *duration_ms);
                increment_tool_calls(tool, "error");
            }
            ObservabilityEvent::NotFound { tool, .. } => {
                increment_tool_calls(tool, "notfound");
            }
            ObservabilityEvent::StrategySuccess {
                topic, duration_ms, ..
            } => {
                record_strategy_latency(topic, *duration_ms);
                metrics::counter!("strategy_messages_total", 1, "topic" => topic.clone(), "outcome" => "success");
            }
            ObservabilityEvent::StrategyError {
                topic, duration_ms, ..
            } => {
                record_strategy_latency(topic, *duration_ms);
                metrics::counter!("strategy_messages_total", 1, "topic" => topic.clone(), "outcome" => "error");
            }
        }
    }
}
