use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-session tunnel byte counters.
///
/// `upstream` counts client → downstream bytes, `downstream` counts
/// downstream → client bytes. Each pump owns one side, so the counters are
/// plain relaxed atomics.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    upstream_bytes: AtomicU64,
    downstream_bytes: AtomicU64,
}

impl TrafficCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_upstream(&self, n: u64) {
        self.upstream_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_downstream(&self, n: u64) {
        self.downstream_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn upstream(&self) -> u64 {
        self.upstream_bytes.load(Ordering::Relaxed)
    }

    pub fn downstream(&self) -> u64 {
        self.downstream_bytes.load(Ordering::Relaxed)
    }

    pub fn get(&self) -> (u64, u64) {
        (self.upstream(), self.downstream())
    }
}

/// Process-wide totals, folded in when a session closes
static TOTALS: TrafficCounters = TrafficCounters {
    upstream_bytes: AtomicU64::new(0),
    downstream_bytes: AtomicU64::new(0),
};

/// Add a finished session's counters to the process totals
pub fn record_session(counters: &TrafficCounters) {
    let (up, down) = counters.get();
    TOTALS.add_upstream(up);
    TOTALS.add_downstream(down);
}

/// Snapshot of process totals (upstream, downstream)
pub fn totals() -> (u64, u64) {
    TOTALS.get()
}
