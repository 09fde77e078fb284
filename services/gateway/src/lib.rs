pub mod client_ip;
pub mod config;
pub mod connection;
pub mod error;
pub mod fanout;
pub mod hub;
pub mod kafka;
pub mod metrics;
pub mod rate_limiter;
pub mod registry;
pub mod replay;
pub mod resource_guard;
pub mod sequence;
pub mod subscription;
pub mod ws;

pub use fanout_protocol::error_codes;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use axum::Router;
use serde::Serialize;

use config::Config;
use error::Result;
use fanout::FanoutEngine;
use hub::Hub;
use kafka::KafkaConsumer;
use metrics::MetricsHandle;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub fanout: Arc<FanoutEngine>,
    pub kafka: Arc<KafkaConsumer>,
    pub metrics: MetricsHandle,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wires up the registry, the two admission gates, the fan-out engine,
    /// and the broker consumer. Fallible because connecting to the
    /// configured brokers can fail before a single connection is ever
    /// accepted.
    pub fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let hub = Arc::new(Hub::new(&config));
        let fanout = Arc::new(FanoutEngine::new(Arc::clone(&hub.registry)));
        let kafka = Arc::new(KafkaConsumer::new(
            &config.kafka_brokers,
            &config.kafka_group_id,
            &config.kafka_topics,
            Arc::clone(&fanout),
            Arc::clone(&hub.resource_guard),
        )?);
        Ok(Self {
            hub,
            fanout,
            kafka,
            metrics: MetricsHandle::install(),
            config,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

#[derive(Serialize)]
struct Capacity {
    current: u64,
    max: u64,
}

#[derive(Serialize)]
struct CpuHealth {
    percentage: f32,
}

#[derive(Serialize)]
struct MemoryHealth {
    percentage: f32,
}

#[derive(Serialize)]
struct TaskHealth {
    current: u64,
}

#[derive(Serialize)]
struct BrokerHealth {
    connected: bool,
}

#[derive(Serialize)]
struct HealthResponse {
    healthy: bool,
    capacity: Capacity,
    cpu: CpuHealth,
    memory: MemoryHealth,
    tasks: TaskHealth,
    broker: BrokerHealth,
}

/// Reports the same admission signals the hub itself gates on, so an
/// external load balancer can stop routing new connections here before
/// the gateway starts rejecting them on its own.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let guard = &state.hub.resource_guard;
    let connected = state.kafka.is_connected();
    let current = guard.connections_current();
    let healthy = connected && !guard.should_reject_connection();

    let body = HealthResponse {
        healthy,
        capacity: Capacity {
            current,
            max: guard.max_connections(),
        },
        cpu: CpuHealth {
            percentage: guard.cpu_percent(),
        },
        memory: MemoryHealth {
            percentage: guard.memory_percent(),
        },
        tasks: TaskHealth {
            current: state.hub.tasks_current(),
        },
        broker: BrokerHealth { connected },
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn render_metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}
