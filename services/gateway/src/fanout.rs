//! Broadcast / fan-out engine: routes one broker record to every connection
//! subscribed to its channel.

use std::sync::Arc;
use std::time::Instant;

use fanout_protocol::{channel, Envelope};
use serde_json::value::RawValue;

use crate::connection::{Connection, EnqueueOutcome, Priority};
use crate::registry::Registry;
use crate::metrics;

pub struct FanoutEngine {
    registry: Arc<Registry>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BroadcastStats {
    pub matched: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub disconnected: u64,
}

impl FanoutEngine {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Delivers a broker record to every connection subscribed to
    /// `symbol.event_type`, at `Priority::High` (the default fan-out
    /// priority per the gateway's backpressure policy).
    pub async fn broadcast(
        &self,
        symbol: &str,
        event_type: fanout_protocol::EventType,
        raw_json: &str,
    ) -> BroadcastStats {
        let channel_name = format!("{symbol}.{event_type}");
        if !channel::is_valid(&channel_name) {
            return BroadcastStats::default();
        }

        let mut targets: Vec<Arc<Connection>> = Vec::new();
        self.registry.for_each(|conn| {
            if conn.is_active() && conn.subscriptions.has(&channel_name) {
                targets.push(Arc::clone(conn));
            }
        });

        let mut stats = BroadcastStats {
            matched: targets.len() as u64,
            ..Default::default()
        };

        let ts = now_ms();
        let start = Instant::now();
        for conn in targets {
            let seq = conn.sequence.next();
            let data = match RawValue::from_string(raw_json.to_string()) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let envelope = Envelope::new(seq, ts, fanout_protocol::message_type::PRICE_UPDATE, data);
            let Ok(text) = envelope.to_json_string() else {
                continue;
            };
            conn.replay.push(envelope);

            match conn
                .enqueue(axum::extract::ws::Message::Text(text.into()), Priority::High)
                .await
            {
                EnqueueOutcome::Sent => {
                    stats.delivered += 1;
                    metrics::record_broadcast_delivered();
                }
                EnqueueOutcome::Dropped => {
                    stats.dropped += 1;
                    metrics::record_broadcast_dropped();
                }
                EnqueueOutcome::Disconnected => {
                    stats.disconnected += 1;
                    metrics::record_slow_client_disconnected();
                }
            }
        }
        metrics::record_broadcast_latency(start.elapsed().as_secs_f64());
        stats
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_protocol::EventType;

    #[tokio::test]
    async fn only_subscribed_connections_receive_the_event() {
        let registry = Arc::new(Registry::new());
        let (sub, mut sub_rx) = Connection::new(registry.reserve_id(), "127.0.0.1".parse().unwrap());
        let sub = Arc::new(sub);
        sub.subscriptions.add_all(&["BTC.trade".to_string()]);
        registry.register(Arc::clone(&sub));

        let (unsub, _unsub_rx) = Connection::new(registry.reserve_id(), "127.0.0.1".parse().unwrap());
        let unsub = Arc::new(unsub);
        unsub.subscriptions.add_all(&["ETH.trade".to_string()]);
        registry.register(Arc::clone(&unsub));

        let engine = FanoutEngine::new(Arc::clone(&registry));
        let stats = engine
            .broadcast("BTC", EventType::Trade, r#"{"p":100}"#)
            .await;

        assert_eq!(stats.matched, 1);
        assert_eq!(stats.delivered, 1);
        assert!(sub_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unsubscribed_connection_sees_no_broadcast() {
        let registry = Arc::new(Registry::new());
        let (conn, mut rx) = Connection::new(registry.reserve_id(), "127.0.0.1".parse().unwrap());
        registry.register(Arc::new(conn));

        let engine = FanoutEngine::new(Arc::clone(&registry));
        engine.broadcast("BTC", EventType::Trade, r#"{"p":1}"#).await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn seq_is_strictly_increasing_per_connection() {
        let registry = Arc::new(Registry::new());
        let (conn, mut rx) = Connection::new(registry.reserve_id(), "127.0.0.1".parse().unwrap());
        let conn = Arc::new(conn);
        conn.subscriptions.add_all(&["BTC.trade".to_string()]);
        registry.register(Arc::clone(&conn));

        let engine = FanoutEngine::new(Arc::clone(&registry));
        engine.broadcast("BTC", EventType::Trade, r#"{"p":1}"#).await;
        engine.broadcast("BTC", EventType::Trade, r#"{"p":2}"#).await;

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        let first_env: fanout_protocol::Envelope = match first {
            axum::extract::ws::Message::Text(t) => serde_json::from_str(&t).unwrap(),
            _ => panic!("expected text"),
        };
        let second_env: fanout_protocol::Envelope = match second {
            axum::extract::ws::Message::Text(t) => serde_json::from_str(&t).unwrap(),
            _ => panic!("expected text"),
        };
        assert!(second_env.seq > first_env.seq);
    }
}
