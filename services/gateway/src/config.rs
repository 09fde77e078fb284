//! Process configuration, parsed once at startup from the environment.

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub max_connections: usize,
    pub max_kafka_rate: u32,
    pub max_broadcast_rate: u32,
    pub cpu_reject_threshold: f32,
    pub cpu_pause_threshold: f32,
    pub cpu_limit: f32,
    pub memory_limit_bytes: u64,
    pub kafka_brokers: String,
    pub kafka_group_id: String,
    pub kafka_topics: Vec<String>,
    pub log_format: LogFormat,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env_or("WS_ADDR", "0.0.0.0:8080")
            .parse()
            .map_err(|e| Error::Config(format!("WS_ADDR is not a valid socket address: {e}")))?;

        let max_connections = parse_env("WS_MAX_CONNECTIONS", 10_000)?;
        let max_kafka_rate = parse_env("WS_MAX_KAFKA_RATE", 25)?;
        let max_broadcast_rate = parse_env("WS_MAX_BROADCAST_RATE", 25)?;
        let cpu_reject_threshold = parse_env("WS_CPU_REJECT_THRESHOLD", 75.0)?;
        let cpu_pause_threshold = parse_env("WS_CPU_PAUSE_THRESHOLD", 80.0)?;
        let cpu_limit = parse_env("WS_CPU_LIMIT", 100.0)?;
        let memory_limit_bytes = parse_env::<u64>("WS_MEMORY_LIMIT", 7 * 1024 * 1024 * 1024)?;

        let kafka_brokers = env::var("KAFKA_BROKERS")
            .map_err(|_| Error::Config("KAFKA_BROKERS must be set".to_string()))?;
        let kafka_group_id = env_or("KAFKA_GROUP_ID", "ws-fanout-gateway");
        let kafka_topics: Vec<String> = env::var("KAFKA_TOPICS")
            .map_err(|_| Error::Config("KAFKA_TOPICS must be set".to_string()))?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if kafka_topics.is_empty() {
            return Err(Error::Config("KAFKA_TOPICS must name at least one topic".to_string()));
        }

        let log_format = match env_or("LOG_FORMAT", "text").as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let config = Self {
            bind_addr,
            max_connections,
            max_kafka_rate,
            max_broadcast_rate,
            cpu_reject_threshold,
            cpu_pause_threshold,
            cpu_limit,
            memory_limit_bytes,
            kafka_brokers,
            kafka_group_id,
            kafka_topics,
            log_format,
            ping_interval: Duration::from_secs(27),
            pong_timeout: Duration::from_secs(30),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.cpu_reject_threshold > self.cpu_pause_threshold {
            return Err(Error::Config(format!(
                "WS_CPU_REJECT_THRESHOLD ({}) must not exceed WS_CPU_PAUSE_THRESHOLD ({}): a gateway that keeps accepting connections after it has stopped consuming would build unbounded backlog",
                self.cpu_reject_threshold, self.cpu_pause_threshold
            )));
        }
        if self.ping_interval >= self.pong_timeout {
            return Err(Error::Config(
                "ping interval must be shorter than the pong timeout".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| Error::Config(format!("{key} is invalid: {e}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_reject_threshold_above_pause_threshold() {
        let mut cfg = valid_config();
        cfg.cpu_reject_threshold = 90.0;
        cfg.cpu_pause_threshold = 80.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_reject_threshold_at_or_below_pause_threshold() {
        let cfg = valid_config();
        assert!(cfg.validate().is_ok());
    }

    fn valid_config() -> Config {
        Config {
            bind_addr: "0.0.0.0:8080".parse().unwrap(),
            max_connections: 10_000,
            max_kafka_rate: 25,
            max_broadcast_rate: 25,
            cpu_reject_threshold: 75.0,
            cpu_pause_threshold: 80.0,
            cpu_limit: 100.0,
            memory_limit_bytes: 7 * 1024 * 1024 * 1024,
            kafka_brokers: "localhost:9092".to_string(),
            kafka_group_id: "test-group".to_string(),
            kafka_topics: vec!["odin.trade".to_string()],
            log_format: LogFormat::Text,
            ping_interval: Duration::from_secs(27),
            pong_timeout: Duration::from_secs(30),
        }
    }
}
