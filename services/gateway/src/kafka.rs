//! Broker ingestion: a `rdkafka` consumer group reading the configured
//! topic set and handing each record off to the fan-out engine.
//!
//! Topics are a fixed per-event-type set (`odin.trade`, `odin.liquidity`,
//! ...); the event type comes from the topic name and the symbol comes
//! from the record key.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use fanout_protocol::channel::EventType;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::Message as _;
use rdkafka::ClientContext;
use rdkafka::TopicPartitionList;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::fanout::FanoutEngine;
use crate::metrics;
use crate::resource_guard::ResourceGuard;

/// Consumer-group membership state, observable from the outside (e.g. a
/// readiness probe) via `KafkaConsumer::state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerState {
    Disconnected = 0,
    Connecting = 1,
    Consuming = 2,
    Rebalancing = 3,
    Stopped = 4,
}

impl ConsumerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConsumerState::Disconnected,
            1 => ConsumerState::Connecting,
            2 => ConsumerState::Consuming,
            3 => ConsumerState::Rebalancing,
            _ => ConsumerState::Stopped,
        }
    }
}

/// Observes consumer-group rebalances so `KafkaConsumer::state` reflects
/// them without the main receive loop having to poll for membership
/// changes itself.
pub struct GatewayConsumerContext {
    state: Arc<AtomicU8>,
}

impl ClientContext for GatewayConsumerContext {}

impl ConsumerContext for GatewayConsumerContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        debug!(?rebalance, "consumer group rebalance starting");
        self.state
            .store(ConsumerState::Rebalancing as u8, Ordering::Release);
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        info!(?rebalance, "consumer group rebalance complete");
        self.state
            .store(ConsumerState::Consuming as u8, Ordering::Release);
        metrics::set_kafka_connected(true);
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        if let Err(e) = result {
            warn!(error = %e, "offset commit failed");
        }
    }
}

pub struct KafkaConsumer {
    consumer: StreamConsumer<GatewayConsumerContext>,
    fanout: Arc<FanoutEngine>,
    resource_guard: Arc<ResourceGuard>,
    state: Arc<AtomicU8>,
}

impl KafkaConsumer {
    pub fn new(
        brokers: &str,
        group_id: &str,
        topics: &[String],
        fanout: Arc<FanoutEngine>,
        resource_guard: Arc<ResourceGuard>,
    ) -> Result<Self> {
        let state = Arc::new(AtomicU8::new(ConsumerState::Connecting as u8));
        let context = GatewayConsumerContext {
            state: Arc::clone(&state),
        };

        let consumer: StreamConsumer<GatewayConsumerContext> = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "true")
            .set("auto.commit.interval.ms", "5000")
            .set("auto.offset.reset", "latest")
            .set("session.timeout.ms", "10000")
            .create_with_context(context)?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topic_refs)?;

        Ok(Self {
            consumer,
            fanout,
            resource_guard,
            state,
        })
    }

    pub fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True once the consumer has joined the group and is consuming or
    /// mid-rebalance; false before the first join and after shutdown.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConsumerState::Consuming | ConsumerState::Rebalancing
        )
    }

    /// Runs forever, handing each record to the fan-out engine, until
    /// `shutdown` fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                message = self.consumer.recv() => {
                    match message {
                        Ok(borrowed) => {
                            self.state.store(ConsumerState::Consuming as u8, Ordering::Release);
                            metrics::set_kafka_connected(true);
                            self.handle_record(&borrowed).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "error receiving from broker");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.state.store(ConsumerState::Stopped as u8, Ordering::Release);
                        metrics::set_kafka_connected(false);
                        info!("kafka consumer shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn handle_record(&self, msg: &rdkafka::message::BorrowedMessage<'_>) {
        if !self.resource_guard.allow_kafka_message() {
            metrics::record_message_dropped("rate_limited");
            return;
        }
        if self.resource_guard.should_pause_kafka() {
            metrics::record_message_dropped("cpu");
            return;
        }

        let Some(event_type) = EventType::from_topic(msg.topic()) else {
            metrics::record_message_dropped("unknown_topic");
            return;
        };
        let Some(symbol) = msg.key().and_then(|k| std::str::from_utf8(k).ok()) else {
            metrics::record_message_dropped("missing_key");
            return;
        };
        let Some(payload) = msg.payload().and_then(|p| std::str::from_utf8(p).ok()) else {
            metrics::record_message_dropped("non_utf8_payload");
            return;
        };

        metrics::record_message_consumed();
        metrics::record_message_size(payload.len() as f64);
        self.fanout.broadcast(symbol, event_type, payload).await;
    }
}
