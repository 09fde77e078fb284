//! Connection-admission rate limiting: a global token bucket plus a
//! per-IP token bucket with background eviction of idle IP entries.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

const GLOBAL_BURST: u32 = 300;
const GLOBAL_RATE_PER_SEC: u32 = 50;
const PER_IP_BURST: u32 = 10;
const PER_IP_RATE_PER_SEC: u32 = 1;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct ConnectionRateLimiter {
    global: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    per_ip: RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>,
}

impl ConnectionRateLimiter {
    pub fn new() -> Self {
        let global_quota = Quota::per_second(NonZeroU32::new(GLOBAL_RATE_PER_SEC).unwrap())
            .allow_burst(NonZeroU32::new(GLOBAL_BURST).unwrap());
        let per_ip_quota = Quota::per_second(NonZeroU32::new(PER_IP_RATE_PER_SEC).unwrap())
            .allow_burst(NonZeroU32::new(PER_IP_BURST).unwrap());
        Self {
            global: RateLimiter::direct(global_quota),
            per_ip: RateLimiter::keyed(per_ip_quota),
        }
    }

    /// Admits a new connection attempt from `ip`, consuming one token from
    /// each bucket only when both have capacity. Checks the per-IP bucket
    /// first so a single flooding IP only ever drains its own bucket
    /// rather than also burning down the shared global budget on every
    /// attempt it was always going to be denied for.
    pub fn check_connection_allowed(&self, ip: IpAddr) -> bool {
        if self.per_ip.check_key(&ip).is_err() {
            return false;
        }
        self.global.check().is_ok()
    }

    /// Runs forever, periodically evicting per-IP buckets that have not
    /// been touched recently so idle clients don't pin memory.
    pub async fn run_sweeper(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.per_ip.retain_recent();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

impl Default for ConnectionRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
