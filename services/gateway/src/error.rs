//! Error taxonomy for the fan-out gateway.
//!
//! Errors on a single connection stay contained to that connection; the
//! `Fatal` variant is the only one expected to propagate out of `main`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fanout_protocol::CloseReason;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("client is too slow to keep up")]
    SlowClient,

    #[error("overloaded: {0}")]
    Overload(&'static str),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("fatal error: {0}")]
    Fatal(String),
}

impl Error {
    /// The WebSocket close code/reason a connection-scoped error maps to.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            Error::ProtocolViolation(_) => CloseReason::PolicyViolation,
            Error::SlowClient | Error::Overload(_) => CloseReason::TryAgainLater,
            Error::TransientNetwork(_) | Error::Fatal(_) | Error::Config(_) => {
                CloseReason::InternalError
            }
            Error::ResourceExhausted(_) => CloseReason::TryAgainLater,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::TransientNetwork(e.to_string())
    }
}

impl From<rdkafka::error::KafkaError> for Error {
    fn from(e: rdkafka::error::KafkaError) -> Self {
        Error::TransientNetwork(e.to_string())
    }
}

/// Maps errors surfaced at the HTTP boundary (connection admission, upgrade)
/// onto status codes.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Overload(_) => StatusCode::TOO_MANY_REQUESTS,
            Error::ProtocolViolation(_) => StatusCode::BAD_REQUEST,
            Error::Config(_) | Error::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::TransientNetwork(_) | Error::SlowClient => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_violation_closes_with_policy_violation() {
        let e = Error::ProtocolViolation("bad json".into());
        assert_eq!(e.close_reason().code(), 1008);
    }

    #[test]
    fn slow_client_closes_with_try_again_later() {
        assert_eq!(Error::SlowClient.close_reason().code(), 1013);
    }
}
