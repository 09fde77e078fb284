//! Sharded connection registry.
//!
//! A single global `RwLock<HashMap<..>>` becomes a lock hotspot once fan-out
//! touches every connection on every broadcast; splitting the id space
//! across fixed shards keeps any one lock's hold time and contention small.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::connection::Connection;

const SHARD_COUNT: usize = 64;

pub struct Registry {
    shards: Vec<RwLock<HashMap<u64, Arc<Connection>>>>,
    next_id: AtomicU64,
    active: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(RwLock::new(HashMap::new()));
        }
        Self {
            shards,
            next_id: AtomicU64::new(1),
            active: AtomicU64::new(0),
        }
    }

    fn shard_for(&self, id: u64) -> &RwLock<HashMap<u64, Arc<Connection>>> {
        &self.shards[(id as usize) % SHARD_COUNT]
    }

    /// Reserves the next connection id without registering anything. The
    /// gateway builds the `Connection` with this id, then calls
    /// `register`.
    pub fn reserve_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&self, conn: Arc<Connection>) {
        let id = conn.id;
        let mut guard = self.shard_for(id).write().expect("registry shard lock poisoned");
        guard.insert(id, conn);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unregister(&self, id: u64) -> Option<Arc<Connection>> {
        let mut guard = self.shard_for(id).write().expect("registry shard lock poisoned");
        let removed = guard.remove(&id);
        if removed.is_some() {
            self.active.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn count(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Visits a concurrent snapshot of every shard. Connections registered
    /// or unregistered during the call may or may not be observed, but the
    /// call itself never panics or double-visits a shard.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Connection>)) {
        for shard in &self.shards {
            let guard = shard.read().expect("registry shard lock poisoned");
            for conn in guard.values() {
                f(conn);
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
