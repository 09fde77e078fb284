//! Per-connection subscription set.
//!
//! One writer (the connection's read loop), many readers (the fan-out
//! engine testing membership on every broadcast). Backed by a `RwLock` over
//! a `HashSet` rather than a lock-free structure: reads are cheap hash
//! lookups and never held across an `.await`, so the extra complexity of a
//! concurrent set buys nothing here.

use std::collections::HashSet;
use std::sync::RwLock;

use fanout_protocol::channel;

#[derive(Debug, Default)]
pub struct SubscriptionSet {
    channels: RwLock<HashSet<String>>,
}

/// Outcome of a subscribe/unsubscribe request against a batch of channel
/// names.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MutationOutcome {
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_all(&self, channels: &[String]) -> MutationOutcome {
        let mut outcome = MutationOutcome::default();
        let mut guard = self.channels.write().expect("subscription set lock poisoned");
        for ch in channels {
            if channel::is_valid(ch) {
                guard.insert(ch.clone());
                outcome.accepted.push(ch.clone());
            } else {
                outcome.rejected.push(ch.clone());
            }
        }
        outcome
    }

    pub fn remove_all(&self, channels: &[String]) -> Vec<String> {
        let mut guard = self.channels.write().expect("subscription set lock poisoned");
        channels
            .iter()
            .filter(|ch| guard.remove(ch.as_str()))
            .cloned()
            .collect()
    }

    pub fn has(&self, channel: &str) -> bool {
        self.channels
            .read()
            .expect("subscription set lock poisoned")
            .contains(channel)
    }

    pub fn count(&self) -> usize {
        self.channels.read().expect("subscription set lock poisoned").len()
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.channels
            .read()
            .expect("subscription set lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_accepts_valid_and_rejects_invalid_channels() {
        let set = SubscriptionSet::new();
        let outcome = set.add_all(&["BTC.trade".to_string(), "bad channel".to_string()]);
        assert_eq!(outcome.accepted, vec!["BTC.trade".to_string()]);
        assert_eq!(outcome.rejected, vec!["bad channel".to_string()]);
        assert_eq!(set.count(), 1);
    }

    #[test]
    fn duplicate_subscribe_is_idempotent() {
        let set = SubscriptionSet::new();
        set.add_all(&["BTC.trade".to_string()]);
        set.add_all(&["BTC.trade".to_string()]);
        assert_eq!(set.count(), 1);
    }

    #[test]
    fn subscribe_then_unsubscribe_yields_empty_set() {
        let set = SubscriptionSet::new();
        set.add_all(&["BTC.trade".to_string()]);
        let removed = set.remove_all(&["BTC.trade".to_string()]);
        assert_eq!(removed, vec!["BTC.trade".to_string()]);
        assert_eq!(set.count(), 0);
        assert!(!set.has("BTC.trade"));
    }

    #[test]
    fn unsubscribe_unknown_channel_is_a_no_op() {
        let set = SubscriptionSet::new();
        let removed = set.remove_all(&["BTC.trade".to_string()]);
        assert!(removed.is_empty());
    }
}
