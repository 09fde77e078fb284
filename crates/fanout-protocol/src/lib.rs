//! Wire protocol for the WebSocket fan-out gateway.
//!
//! Channel names follow the grammar `SYMBOL.EVENT_TYPE` (e.g. `BTC.trade`).
//! Outgoing envelopes carry a per-connection monotonic `seq`, a send
//! timestamp, a `type` tag, and an opaque `data` payload that is spliced in
//! verbatim rather than re-serialized, since broker payloads already arrive
//! as valid JSON.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::fmt;

pub mod channel;
pub mod error_codes;

pub use channel::{ChannelError, EventType};

/// An outgoing message to a WebSocket client.
///
/// `data` is boxed `RawValue` so serializing an `Envelope` splices the
/// already-valid JSON bytes in place rather than parsing and re-emitting
/// them.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    pub ts: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Box<RawValue>,
}

impl Clone for Envelope {
    fn clone(&self) -> Self {
        Self {
            seq: self.seq,
            ts: self.ts,
            kind: self.kind.clone(),
            data: RawValue::from_string(self.data.get().to_string())
                .expect("RawValue contents were already valid JSON"),
        }
    }
}

impl Envelope {
    pub fn new(seq: u64, ts: i64, kind: impl Into<String>, data: Box<RawValue>) -> Self {
        Self {
            seq,
            ts,
            kind: kind.into(),
            data,
        }
    }

    /// Builds an envelope whose `data` is a serializable value, encoding it
    /// once up front.
    pub fn with_value<T: Serialize>(
        seq: u64,
        ts: i64,
        kind: impl Into<String>,
        value: &T,
    ) -> serde_json::Result<Self> {
        let raw = serde_json::value::to_raw_value(value)?;
        Ok(Self::new(seq, ts, kind, raw))
    }

    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Well-known server -> client envelope `type` tags.
pub mod message_type {
    pub const SUBSCRIPTION_ACK: &str = "subscription_ack";
    pub const UNSUBSCRIPTION_ACK: &str = "unsubscription_ack";
    pub const PRICE_UPDATE: &str = "price:update";
    pub const PONG: &str = "pong";
    pub const REPLAY_MISS: &str = "replay_miss";
    pub const SERVER_SHUTDOWN: &str = "server_shutdown";
    pub const ERROR: &str = "error";
}

/// A message a client sends to the server. Tagged on `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { data: ChannelList },
    Unsubscribe { data: ChannelList },
    Heartbeat,
    Replay { data: ReplayRange },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelList {
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayRange {
    pub from: u64,
    pub to: u64,
}

/// Acknowledgement payload for `subscription_ack` / `unsubscription_ack`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionAck {
    pub channels: Vec<String>,
    pub count: usize,
}

/// Payload carried in a `replay_miss` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayMiss {
    pub requested_from: u64,
    pub requested_to: u64,
    pub oldest_available: Option<u64>,
}

/// Payload carried in an `error` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

/// WebSocket close reasons, matching RFC 6455 status codes this gateway
/// actually uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PolicyViolation,
    InternalError,
    TryAgainLater,
    Normal,
}

impl CloseReason {
    pub const fn code(self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            CloseReason::PolicyViolation => 1008,
            CloseReason::InternalError => 1011,
            CloseReason::TryAgainLater => 1013,
        }
    }

    pub const fn reason(self) -> &'static str {
        match self {
            CloseReason::Normal => "normal",
            CloseReason::PolicyViolation => "policy_violation",
            CloseReason::InternalError => "internal_error",
            CloseReason::TryAgainLater => "try_again_later",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason(), self.code())
    }
}
