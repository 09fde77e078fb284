//! Shared connection-lifecycle state: the registry, the two admission
//! gates (rate limiter, resource guard), and the background tasks that
//! keep them honest.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::Message;
use fanout_protocol::{message_type, Envelope};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics;
use crate::rate_limiter::ConnectionRateLimiter;
use crate::registry::Registry;
use crate::resource_guard::ResourceGuard;

const METRICS_REPORT_INTERVAL: Duration = Duration::from_secs(5);
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Fixed background tasks spawned once per process in `main`: the Kafka
/// consumer loop, the CPU sampler, the rate-limiter sweep, and this
/// metrics reporter itself. Each live connection adds exactly one more
/// (see `ws.rs`'s single-task-per-connection model).
const BACKGROUND_TASK_COUNT: u64 = 4;

pub struct Hub {
    pub registry: Arc<Registry>,
    pub resource_guard: Arc<ResourceGuard>,
    pub rate_limiter: Arc<ConnectionRateLimiter>,
}

impl Hub {
    pub fn new(config: &Config) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            resource_guard: Arc::new(ResourceGuard::new(
                config.max_connections as u64,
                config.max_kafka_rate,
                config.max_broadcast_rate,
                config.cpu_reject_threshold,
                config.cpu_pause_threshold,
                config.cpu_limit,
                config.memory_limit_bytes,
            )),
            rate_limiter: Arc::new(ConnectionRateLimiter::new()),
        }
    }

    /// Admits a new connection attempt from `ip`, checking the per-IP/global
    /// rate limiter before the heavier resource-pressure check.
    pub fn admit(&self, ip: IpAddr) -> Result<()> {
        if !self.rate_limiter.check_connection_allowed(ip) {
            metrics::record_connection_rejected("rate_limited");
            return Err(Error::Overload("connection rate limit exceeded"));
        }
        if self.resource_guard.should_reject_connection() {
            metrics::record_connection_rejected("overloaded");
            return Err(Error::ResourceExhausted("gateway is at capacity"));
        }
        Ok(())
    }

    /// One task per live connection plus the fixed set of background tasks
    /// spawned once at startup. Tokio tasks aren't OS threads, so this is
    /// informational only (see `metrics::set_tasks_current`).
    pub fn tasks_current(&self) -> u64 {
        self.registry.count() + BACKGROUND_TASK_COUNT
    }

    /// Runs forever, periodically folding the registry's live connection
    /// count into the resource guard and exporting it as a gauge.
    pub async fn run_metrics_reporter(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(METRICS_REPORT_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let count = self.registry.count();
                    self.resource_guard.set_connections_current(count);
                    metrics::set_connections_current(count);
                    metrics::set_tasks_current(self.tasks_current());
                    metrics::set_cpu_percent(self.resource_guard.cpu_percent());
                    metrics::set_memory_bytes(self.resource_guard.memory_bytes());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("metrics reporter shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Notifies every active connection with a `server_shutdown` envelope and
    /// begins closing it, then waits (bounded) for the registry to drain so
    /// the process doesn't exit out from under sockets still mid-write.
    pub async fn shutdown(&self) {
        let ts = now_ms();
        self.registry.for_each(|conn| {
            if !conn.is_active() {
                return;
            }
            let seq = conn.sequence.next();
            if let Ok(envelope) =
                Envelope::with_value(seq, ts, message_type::SERVER_SHUTDOWN, &serde_json::json!({}))
            {
                if let Ok(text) = envelope.to_json_string() {
                    let _ = conn.try_enqueue(Message::Text(text.into()));
                }
            }
            conn.begin_close();
        });

        let deadline = Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        while self.registry.count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
        let remaining = self.registry.count();
        if remaining > 0 {
            warn!(remaining, "shutdown drain timed out with connections still open");
        }
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
