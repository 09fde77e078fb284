//! Prometheus metrics exposition and the counters/gauges/histograms the
//! rest of the gateway records against.

use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();

#[derive(Clone)]
pub struct MetricsHandle(PrometheusHandle);

impl MetricsHandle {
    /// Installs the global Prometheus recorder on first call; later calls
    /// (multiple `AppState`s in the same process, as in the test suite)
    /// reuse the already-installed handle instead of erroring.
    pub fn install() -> Self {
        let handle = RECORDER.get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install the Prometheus metrics recorder")
        });
        Self(handle.clone())
    }

    pub fn render(&self) -> String {
        self.0.render()
    }
}

pub fn record_connection_accepted() {
    metrics::counter!("connections_total").increment(1);
}

pub fn record_connection_rejected(reason: &'static str) {
    metrics::counter!("connections_rejected_total", "reason" => reason).increment(1);
}

pub fn record_message_consumed() {
    metrics::counter!("messages_consumed_total").increment(1);
}

pub fn record_message_dropped(reason: &'static str) {
    metrics::counter!("messages_dropped_total", "reason" => reason).increment(1);
}

pub fn record_broadcast_delivered() {
    metrics::counter!("broadcast_delivered_total").increment(1);
}

pub fn record_broadcast_dropped() {
    metrics::counter!("broadcast_dropped_total").increment(1);
}

pub fn record_slow_client_disconnected() {
    metrics::counter!("slow_clients_disconnected_total").increment(1);
}

pub fn set_connections_current(count: u64) {
    metrics::gauge!("connections_current").set(count as f64);
}

pub fn set_cpu_percent(percent: f32) {
    metrics::gauge!("cpu_percent").set(percent as f64);
}

pub fn set_memory_bytes(bytes: u64) {
    metrics::gauge!("memory_bytes").set(bytes as f64);
}

/// Tokio tasks are not OS threads, so this gauge is informational only.
/// Each connection here is driven by a single task (see `ws.rs`), so the
/// count tracks the registry's active-connection count plus the fixed
/// set of background tasks (consumer, CPU sampler, rate-limiter sweep,
/// metrics reporter).
pub fn set_tasks_current(count: u64) {
    metrics::gauge!("tasks_current").set(count as f64);
}

pub fn set_kafka_connected(connected: bool) {
    metrics::gauge!("kafka_connected").set(if connected { 1.0 } else { 0.0 });
}

pub fn record_broadcast_latency(seconds: f64) {
    metrics::histogram!("broadcast_latency_seconds").record(seconds);
}

pub fn record_message_size(bytes: f64) {
    metrics::histogram!("message_size_bytes").record(bytes);
}
