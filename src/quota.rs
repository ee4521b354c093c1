use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::store::CounterStore;

/// Namespace for per-identity byte counters
pub const QUOTA_KEY_PREFIX: &str = "bw:";

/// Bytes per second in one gigabit per second
pub const BYTES_PER_GBIT: f64 = 125_000_000.0;

/// Default lifetime of a counter after a violation
pub const DEFAULT_QUOTA_WINDOW: Duration = Duration::from_secs(1);

/// Counter key shared by every session of `identity`, in both directions
pub fn quota_key(identity: &str) -> String {
    format!("{}{}", QUOTA_KEY_PREFIX, identity)
}

/// Convert a Gb/s ceiling to a byte cap per window
pub fn limit_from_gbps(max_gbps: f64) -> u64 {
    (max_gbps * BYTES_PER_GBIT) as u64
}

/// Outcome of one admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Counter value after this chunk; 0 when the store could not be reached
    pub total: u64,
    pub exceeded: bool,
}

/// Per-identity byte quota backed by the shared counter store.
///
/// The counter only ever grows until a chunk pushes it over the cap; the
/// violation then arms a short expiry so traffic resumes once it lapses.
#[derive(Clone)]
pub struct QuotaEnforcer {
    store: Arc<dyn CounterStore>,
    limit_bytes: u64,
    window: Duration,
}

impl QuotaEnforcer {
    pub fn new(store: Arc<dyn CounterStore>, limit_bytes: u64, window: Duration) -> Self {
        Self {
            store,
            limit_bytes,
            window,
        }
    }

    pub fn limit_bytes(&self) -> u64 {
        self.limit_bytes
    }

    /// Charge `n` bytes to `identity`.
    ///
    /// A store failure is reported as exceeded.
    pub async fn admit(&self, identity: &str, n: u64) -> Admission {
        let key = quota_key(identity);
        let total = match self.store.incr_by(&key, n).await {
            Ok(total) => total,
            Err(e) => {
                warn!("Quota counter {} unavailable, failing closed: {}", key, e);
                return Admission {
                    total: 0,
                    exceeded: true,
                };
            }
        };

        let exceeded = total > self.limit_bytes;
        if exceeded {
            if let Err(e) = self.store.expire(&key, self.window).await {
                warn!("Failed to arm expiry on {}: {}", key, e);
            }
        }
        Admission { total, exceeded }
    }
}
