//! Channel name grammar: `SYMBOL.EVENT_TYPE`.

use std::fmt;

/// The closed set of event-type categories a channel may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Trade,
    Liquidity,
    Metadata,
    Social,
    Community,
    Creation,
    Analytics,
    Balances,
}

impl EventType {
    pub const ALL: &'static [EventType] = &[
        EventType::Trade,
        EventType::Liquidity,
        EventType::Metadata,
        EventType::Social,
        EventType::Community,
        EventType::Creation,
        EventType::Analytics,
        EventType::Balances,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            EventType::Trade => "trade",
            EventType::Liquidity => "liquidity",
            EventType::Metadata => "metadata",
            EventType::Social => "social",
            EventType::Community => "community",
            EventType::Creation => "creation",
            EventType::Analytics => "analytics",
            EventType::Balances => "balances",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|e| e.as_str() == s)
    }

    /// Maps a broker topic name (`odin.<event_type>`) to its event type, the
    /// convention this gateway's topic set uses.
    pub fn from_topic(topic: &str) -> Option<Self> {
        topic.strip_prefix("odin.").and_then(Self::parse)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("empty channel name")]
    Empty,
    #[error("channel {0:?} missing SYMBOL.EVENT_TYPE separator")]
    MissingSeparator(String),
    #[error("channel {0:?} has invalid symbol component")]
    InvalidSymbol(String),
    #[error("channel {0:?} has unknown event type {1:?}")]
    UnknownEventType(String, String),
}

fn is_valid_symbol(symbol: &str) -> bool {
    !symbol.is_empty()
        && symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Validates a client-supplied channel string against the
/// `SYMBOL.EVENT_TYPE` grammar, returning the parsed parts on success.
pub fn parse(channel: &str) -> Result<(&str, EventType), ChannelError> {
    if channel.is_empty() {
        return Err(ChannelError::Empty);
    }
    let (symbol, event_type) = channel
        .rsplit_once('.')
        .ok_or_else(|| ChannelError::MissingSeparator(channel.to_string()))?;
    if !is_valid_symbol(symbol) {
        return Err(ChannelError::InvalidSymbol(channel.to_string()));
    }
    let parsed_event = EventType::parse(event_type)
        .ok_or_else(|| ChannelError::UnknownEventType(channel.to_string(), event_type.to_string()))?;
    Ok((symbol, parsed_event))
}

pub fn is_valid(channel: &str) -> bool {
    parse(channel).is_ok()
}

/// Builds the channel string a broker record with the given symbol and
/// topic derives to.
pub fn from_topic_and_symbol(topic: &str, symbol: &str) -> Option<String> {
    EventType::from_topic(topic).map(|event_type| format!("{symbol}.{event_type}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_channel() {
        assert_eq!(parse("BTC.trade"), Ok(("BTC", EventType::Trade)));
    }

    #[test]
    fn rejects_empty_channel() {
        assert_eq!(parse(""), Err(ChannelError::Empty));
    }

    #[test]
    fn rejects_missing_separator() {
        assert!(matches!(parse("BTC"), Err(ChannelError::MissingSeparator(_))));
    }

    #[test]
    fn rejects_unknown_event_type() {
        assert!(matches!(
            parse("BTC.explosion"),
            Err(ChannelError::UnknownEventType(_, _))
        ));
    }

    #[test]
    fn rejects_invalid_symbol_characters() {
        assert!(matches!(parse("BT C.trade"), Err(ChannelError::InvalidSymbol(_))));
    }

    #[test]
    fn accepts_underscores_and_hyphens_in_symbol() {
        assert!(is_valid("WIF_DOG-2.social"));
    }

    #[test]
    fn derives_channel_from_topic_and_key() {
        assert_eq!(
            from_topic_and_symbol("odin.trade", "BTC"),
            Some("BTC.trade".to_string())
        );
        assert_eq!(from_topic_and_symbol("odin.unknown", "BTC"), None);
    }
}
