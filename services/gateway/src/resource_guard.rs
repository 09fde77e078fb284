//! CPU sampling and the two broker-facing admission token buckets
//! (ingestion rate, broadcast rate).

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use sysinfo::{Pid, System};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const CPU_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
const EMA_ALPHA: f32 = 0.3;

pub struct ResourceGuard {
    cpu_percent_bits: AtomicU32,
    memory_bytes: AtomicU64,
    memory_limit_bytes: u64,
    connections_current: AtomicU64,
    max_connections: u64,
    cpu_reject_threshold: f32,
    cpu_pause_threshold: f32,
    cpu_limit: f32,
    kafka_bucket: DirectLimiter,
    broadcast_bucket: DirectLimiter,
}

impl ResourceGuard {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        max_connections: u64,
        max_kafka_rate: u32,
        max_broadcast_rate: u32,
        cpu_reject_threshold: f32,
        cpu_pause_threshold: f32,
        cpu_limit: f32,
        memory_limit_bytes: u64,
    ) -> Self {
        Self {
            cpu_percent_bits: AtomicU32::new(0f32.to_bits()),
            memory_bytes: AtomicU64::new(0),
            memory_limit_bytes,
            connections_current: AtomicU64::new(0),
            max_connections,
            cpu_reject_threshold,
            cpu_pause_threshold,
            cpu_limit: cpu_limit.max(1.0),
            kafka_bucket: RateLimiter::direct(rate_quota(max_kafka_rate)),
            broadcast_bucket: RateLimiter::direct(rate_quota(max_broadcast_rate)),
        }
    }

    pub fn set_connections_current(&self, count: u64) {
        self.connections_current.store(count, Ordering::Relaxed);
    }

    pub fn connections_current(&self) -> u64 {
        self.connections_current.load(Ordering::Relaxed)
    }

    pub fn max_connections(&self) -> u64 {
        self.max_connections
    }

    pub fn cpu_percent(&self) -> f32 {
        f32::from_bits(self.cpu_percent_bits.load(Ordering::Relaxed))
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_bytes.load(Ordering::Relaxed)
    }

    pub fn memory_percent(&self) -> f32 {
        if self.memory_limit_bytes == 0 {
            return 0.0;
        }
        (self.memory_bytes() as f32 / self.memory_limit_bytes as f32) * 100.0
    }

    pub fn allow_kafka_message(&self) -> bool {
        self.kafka_bucket.check().is_ok()
    }

    pub fn allow_broadcast(&self) -> bool {
        self.broadcast_bucket.check().is_ok()
    }

    pub fn should_pause_kafka(&self) -> bool {
        self.cpu_percent() >= self.cpu_pause_threshold
    }

    /// Synthetically drives the CPU gauge without waiting on
    /// `run_cpu_sampler`'s real sampling interval. Bypasses the EMA so
    /// integration tests can assert against an exact value; production code
    /// never calls this, only `run_cpu_sampler`.
    #[doc(hidden)]
    pub fn set_cpu_percent_for_test(&self, percent: f32) {
        self.cpu_percent_bits.store(percent.to_bits(), Ordering::Relaxed);
    }

    pub fn should_reject_connection(&self) -> bool {
        self.cpu_percent() >= self.cpu_reject_threshold
            || self.connections_current.load(Ordering::Relaxed) >= self.max_connections
    }

    /// Runs forever, sampling this process's CPU usage on `CPU_SAMPLE_INTERVAL`
    /// and folding it into an exponential moving average. Intended to be
    /// spawned once as a background task.
    pub async fn run_cpu_sampler(&self, shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut shutdown = shutdown;
        let pid = sysinfo::get_current_pid().ok();
        let mut system = System::new();
        let mut interval = tokio::time::interval(CPU_SAMPLE_INTERVAL);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let (cpu_sample, memory_sample) = self.sample(&mut system, pid);
                    self.fold_sample(self.normalize_cpu(cpu_sample));
                    self.memory_bytes.store(memory_sample, Ordering::Relaxed);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    fn sample(&self, system: &mut System, pid: Option<Pid>) -> (f32, u64) {
        match pid {
            Some(pid) => {
                system.refresh_process(pid);
                system
                    .process(pid)
                    .map(|p| (p.cpu_usage(), p.memory()))
                    .unwrap_or((0.0, 0))
            }
            None => {
                system.refresh_cpu();
                (system.global_cpu_info().cpu_usage(), 0)
            }
        }
    }

    /// `sysinfo` reports per-process CPU as a percentage of one core, so a
    /// process pinning 2 of an 8-core budget reads 200%, not 25%. Rescale
    /// against the configured core budget (`WS_CPU_LIMIT`) so the reject/
    /// pause thresholds, both expressed as 0-100, mean "percent of the
    /// budget this process is allowed" rather than "percent of one core".
    fn normalize_cpu(&self, raw_percent: f32) -> f32 {
        (raw_percent / self.cpu_limit) * 100.0
    }

    fn fold_sample(&self, sample: f32) {
        let prev = self.cpu_percent();
        let next = EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * prev;
        self.cpu_percent_bits.store(next.to_bits(), Ordering::Relaxed);
    }
}

fn rate_quota(per_second: u32) -> Quota {
    let rate = NonZeroU32::new(per_second.max(1)).unwrap();
    Quota::per_second(rate).allow_burst(NonZeroU32::new(per_second.max(1) * 2).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> ResourceGuard {
        ResourceGuard::new(10, 5, 5, 75.0, 80.0, 100.0, 1024 * 1024 * 1024)
    }

    #[test]
    fn memory_percent_is_relative_to_the_configured_limit() {
        let guard = guard();
        guard.memory_bytes.store(512 * 1024 * 1024, Ordering::Relaxed);
        assert!((guard.memory_percent() - 50.0).abs() < 0.01);
    }

    #[test]
    fn rejects_new_connections_once_cpu_crosses_reject_threshold() {
        let guard = guard();
        guard.fold_sample(90.0);
        assert!(guard.should_reject_connection());
    }

    #[test]
    fn rejects_new_connections_once_at_capacity() {
        let guard = guard();
        guard.set_connections_current(10);
        assert!(guard.should_reject_connection());
    }

    #[test]
    fn pauses_kafka_once_cpu_crosses_pause_threshold() {
        let guard = guard();
        guard.fold_sample(85.0);
        assert!(guard.should_pause_kafka());
    }

    #[test]
    fn ema_smooths_a_single_spike() {
        let guard = guard();
        guard.fold_sample(100.0);
        // alpha=0.3 against a 0 baseline -> 30.0, not the full spike.
        assert!((guard.cpu_percent() - 30.0).abs() < 0.01);
    }

    #[test]
    fn cpu_is_normalized_against_the_configured_core_budget() {
        let guard = ResourceGuard::new(10, 5, 5, 75.0, 80.0, 4.0, 1024 * 1024 * 1024);
        // Pinning 2 of a 4-core budget reads 200% from sysinfo; normalized
        // against the budget that's 50%, well under either threshold.
        assert!((guard.normalize_cpu(200.0) - 50.0).abs() < 0.01);
    }

    #[test]
    fn kafka_bucket_admits_burst_then_denies() {
        let guard = guard();
        let mut admitted = 0;
        for _ in 0..20 {
            if guard.allow_kafka_message() {
                admitted += 1;
            }
        }
        assert!(admitted >= 5 && admitted < 20);
    }
}
