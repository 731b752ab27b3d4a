use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Hit, miss and recycling counters for every tier.
///
/// Counters only ever grow, except `disk_size` which mirrors the disk cache's running
/// total.
#[derive(Debug, Default)]
pub struct Stats {
    pub(crate) memory_hit: AtomicU64,
    pub(crate) memory_miss: AtomicU64,
    pub(crate) memory_reuse: AtomicU64,
    pub(crate) memory_returned: AtomicU64,
    pub(crate) memory_thrown: AtomicU64,

    pub(crate) disk_hit: AtomicU64,
    pub(crate) disk_miss: AtomicU64,
    pub(crate) disk_scans: AtomicU64,
    pub(crate) disk_size: AtomicU64,

    pub(crate) network_success: AtomicU64,
    pub(crate) network_failure: AtomicU64,
    pub(crate) network_canceled: AtomicU64,
}

/// A point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub memory_hit: u64,
    pub memory_miss: u64,
    pub memory_reuse: u64,
    pub memory_returned: u64,
    pub memory_thrown: u64,
    pub disk_hit: u64,
    pub disk_miss: u64,
    pub disk_scans: u64,
    pub disk_size: u64,
    pub network_success: u64,
    pub network_failure: u64,
    pub network_canceled: u64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            memory_hit: get(&self.memory_hit),
            memory_miss: get(&self.memory_miss),
            memory_reuse: get(&self.memory_reuse),
            memory_returned: get(&self.memory_returned),
            memory_thrown: get(&self.memory_thrown),
            disk_hit: get(&self.disk_hit),
            disk_miss: get(&self.disk_miss),
            disk_scans: get(&self.disk_scans),
            disk_size: get(&self.disk_size),
            network_success: get(&self.network_success),
            network_failure: get(&self.network_failure),
            network_canceled: get(&self.network_canceled),
        }
    }

    /// A human readable report, one line per tier.
    pub fn report(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();
        // writing into a `String` cannot fail
        let _ = writeln!(
            out,
            "memory: hit={} miss={} reuse={} returned={} thrown={}",
            s.memory_hit, s.memory_miss, s.memory_reuse, s.memory_returned, s.memory_thrown
        );
        let _ = writeln!(
            out,
            "disk: hit={} miss={} scans={} size={}",
            s.disk_hit, s.disk_miss, s.disk_scans, s.disk_size
        );
        let _ = write!(
            out,
            "network: success={} failure={} canceled={}",
            s.network_success, s.network_failure, s.network_canceled
        );
        out
    }
}
