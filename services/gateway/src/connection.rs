//! A single live WebSocket connection: identity, subscription state, replay
//! buffer, sequence generator, and its bounded outgoing send queue.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::time::Duration;

use axum::extract::ws::Message;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::replay::ReplayBuffer;
use crate::sequence::SequenceGenerator;
use crate::subscription::SubscriptionSet;

const SEND_QUEUE_CAPACITY: usize = 256;
const HIGH_PRIORITY_TIMEOUT: Duration = Duration::from_millis(100);
const CRITICAL_PRIORITY_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Active = 0,
    Closing = 1,
    Closed = 2,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => State::Active,
            1 => State::Closing,
            _ => State::Closed,
        }
    }
}

/// Delivery priority. Determines how hard `Connection::enqueue` tries
/// before giving up on a slow client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Sent,
    Dropped,
    Disconnected,
}

pub struct Connection {
    pub id: u64,
    pub ip: std::net::IpAddr,
    state: AtomicU8,
    slow: AtomicBool,
    last_activity_ms: AtomicI64,
    pub subscriptions: SubscriptionSet,
    pub replay: ReplayBuffer,
    pub sequence: SequenceGenerator,
    sender: mpsc::Sender<Message>,
    close_signal: tokio::sync::Notify,
}

impl Connection {
    /// Creates a connection and its paired receiver half, which the
    /// connection's send loop owns.
    pub fn new(id: u64, ip: std::net::IpAddr) -> (Self, mpsc::Receiver<Message>) {
        let (sender, receiver) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let conn = Self {
            id,
            ip,
            state: AtomicU8::new(State::Active as u8),
            slow: AtomicBool::new(false),
            last_activity_ms: AtomicI64::new(now_ms()),
            subscriptions: SubscriptionSet::new(),
            replay: ReplayBuffer::new(),
            sequence: SequenceGenerator::new(),
            sender,
            close_signal: tokio::sync::Notify::new(),
        };
        (conn, receiver)
    }

    /// Resolves once this connection has been asked to close, for a
    /// connection task blocked in a `tokio::select!` to wake up on.
    pub async fn wait_for_close_signal(&self) {
        self.close_signal.notified().await;
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == State::Active
    }

    pub fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let elapsed_ms = now_ms() - self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(elapsed_ms.max(0) as u64)
    }

    /// First caller to transition out of `Active` wins; subsequent callers
    /// observe the transition already happened and are no-ops.
    pub fn begin_close(&self) -> bool {
        let transitioned = self
            .state
            .compare_exchange(
                State::Active as u8,
                State::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if transitioned {
            self.close_signal.notify_one();
        }
        transitioned
    }

    pub fn mark_closed(&self) {
        self.state.store(State::Closed as u8, Ordering::Release);
    }

    /// True once this connection has been closed for falling behind on its
    /// send queue, as opposed to a socket error or a shutdown signal. Lets
    /// the connection task pick the right WebSocket close code once it
    /// observes `wait_for_close_signal` resolve.
    pub fn is_slow(&self) -> bool {
        self.slow.load(Ordering::Acquire)
    }

    /// Attempts to deliver a frame according to `priority`. Never panics;
    /// a full queue or a timeout is reported back to the caller instead of
    /// blocking the fan-out path indefinitely.
    pub async fn enqueue(&self, message: Message, priority: Priority) -> EnqueueOutcome {
        match priority {
            Priority::Normal => self.try_enqueue(message),
            Priority::High => self.enqueue_with_timeout(message, HIGH_PRIORITY_TIMEOUT).await,
            Priority::Critical => {
                self.enqueue_with_timeout(message, CRITICAL_PRIORITY_TIMEOUT).await
            }
        }
    }

    /// Non-blocking enqueue, usable from a synchronous context (e.g. the
    /// registry's shutdown sweep, which visits connections under a sync
    /// `for_each` closure).
    pub fn try_enqueue(&self, message: Message) -> EnqueueOutcome {
        match self.sender.try_send(message) {
            Ok(()) => EnqueueOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => EnqueueOutcome::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => EnqueueOutcome::Disconnected,
        }
    }

    async fn enqueue_with_timeout(&self, message: Message, wait: Duration) -> EnqueueOutcome {
        match timeout(wait, self.sender.send(message)).await {
            Ok(Ok(())) => EnqueueOutcome::Sent,
            Ok(Err(_)) => EnqueueOutcome::Disconnected,
            Err(_) => {
                self.slow.store(true, Ordering::Release);
                self.begin_close();
                EnqueueOutcome::Disconnected
            }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn normal_priority_drops_on_full_queue_without_blocking() {
        let (conn, mut rx) = Connection::new(1, "127.0.0.1".parse().unwrap());
        for _ in 0..SEND_QUEUE_CAPACITY {
            let outcome = conn.enqueue(Message::Text("x".into()), Priority::Normal).await;
            assert_eq!(outcome, EnqueueOutcome::Sent);
        }
        let outcome = conn.enqueue(Message::Text("overflow".into()), Priority::Normal).await;
        assert_eq!(outcome, EnqueueOutcome::Dropped);
        drop(rx.recv().await);
    }

    #[tokio::test]
    async fn begin_close_is_exactly_once() {
        let (conn, _rx) = Connection::new(1, "127.0.0.1".parse().unwrap());
        assert!(conn.begin_close());
        assert!(!conn.begin_close());
        assert_eq!(conn.state(), State::Closing);
    }

    #[tokio::test(start_paused = true)]
    async fn critical_priority_disconnects_a_saturated_slow_client() {
        let (conn, _rx) = Connection::new(1, "127.0.0.1".parse().unwrap());
        for _ in 0..SEND_QUEUE_CAPACITY {
            let _ = conn.enqueue(Message::Text("x".into()), Priority::Normal).await;
        }
        // Nobody is draining the receiver, so even the critical path times out.
        let outcome = conn
            .enqueue(Message::Text("final".into()), Priority::Critical)
            .await;
        assert_eq!(outcome, EnqueueOutcome::Disconnected);
        assert_eq!(conn.state(), State::Closing);
        assert!(conn.is_slow());
    }

    #[tokio::test]
    async fn a_plain_shutdown_close_is_not_flagged_slow() {
        let (conn, _rx) = Connection::new(1, "127.0.0.1".parse().unwrap());
        conn.begin_close();
        assert!(!conn.is_slow());
    }
}
