//! Bounded per-connection ring buffer of recently sent envelopes, used to
//! serve `replay` requests without retaining unbounded history.

use std::collections::VecDeque;
use std::sync::Mutex;

use fanout_protocol::Envelope;

const DEFAULT_CAPACITY: usize = 100;

pub struct ReplayBuffer {
    capacity: usize,
    ring: Mutex<VecDeque<Envelope>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Miss {
    pub oldest_available: Option<u64>,
}

impl ReplayBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, envelope: Envelope) {
        let mut ring = self.ring.lock().expect("replay buffer lock poisoned");
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(envelope);
    }

    /// Returns the envelopes in `[from, to]` in ascending `seq` order, or a
    /// `Miss` if `from` is older than what is still retained.
    pub fn range(&self, from: u64, to: u64) -> Result<Vec<Envelope>, Miss> {
        let ring = self.ring.lock().expect("replay buffer lock poisoned");
        let oldest = ring.front().map(|e| e.seq);
        match oldest {
            Some(oldest_seq) if from < oldest_seq => Err(Miss {
                oldest_available: oldest,
            }),
            None => Err(Miss {
                oldest_available: None,
            }),
            _ => Ok(ring
                .iter()
                .filter(|e| e.seq >= from && e.seq <= to)
                .cloned()
                .collect()),
        }
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(seq: u64) -> Envelope {
        Envelope::new(
            seq,
            0,
            "price:update",
            serde_json::value::RawValue::from_string("{}".to_string()).unwrap(),
        )
    }

    #[test]
    fn range_returns_envelopes_in_ascending_order() {
        let buf = ReplayBuffer::new();
        for seq in 1..=5 {
            buf.push(envelope(seq));
        }
        let got = buf.range(2, 4).unwrap();
        let seqs: Vec<u64> = got.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[test]
    fn overflow_evicts_oldest_entry() {
        let buf = ReplayBuffer::with_capacity(3);
        for seq in 1..=4 {
            buf.push(envelope(seq));
        }
        // seq 1 was evicted; requesting it is a miss.
        assert!(buf.range(1, 4).is_err());
        let got = buf.range(2, 4).unwrap();
        assert_eq!(got.len(), 3);
    }

    #[test]
    fn requesting_a_range_older_than_retention_is_a_miss() {
        let buf = ReplayBuffer::with_capacity(2);
        for seq in 10..=12 {
            buf.push(envelope(seq));
        }
        let miss = buf.range(1, 5).unwrap_err();
        assert_eq!(miss.oldest_available, Some(11));
    }

    #[test]
    fn empty_buffer_reports_a_miss_with_no_oldest() {
        let buf = ReplayBuffer::new();
        let miss = buf.range(1, 5).unwrap_err();
        assert_eq!(miss.oldest_available, None);
    }
}
