use std::sync::atomic::{AtomicUsize, Ordering};

/// Global gauge of live tunnel sessions
pub static ACTIVE_SESSIONS: AtomicUsize = AtomicUsize::new(0);

/// Session counts above these marks are reported by the status task
pub const MODERATE_LOAD_THRESHOLD: usize = 5_000;
pub const HIGH_LOAD_THRESHOLD: usize = 15_000;
pub const CRITICAL_LOAD_THRESHOLD: usize = 25_000;

/// RAII guard that keeps [`ACTIVE_SESSIONS`] accurate.
///
/// The listener admits every connection; the gauge only observes, it never
/// refuses a slot.
pub struct SessionGuard {
    decremented: bool,
}

impl SessionGuard {
    /// Register a new live session
    pub fn new() -> Self {
        ACTIVE_SESSIONS.fetch_add(1, Ordering::AcqRel);
        Self { decremented: false }
    }

    /// Release the slot early; later calls and the eventual drop are no-ops
    pub fn decrement(&mut self) {
        if !self.decremented {
            ACTIVE_SESSIONS.fetch_sub(1, Ordering::AcqRel);
            self.decremented = true;
        }
    }

    /// Current number of live sessions
    pub fn active_count() -> usize {
        ACTIVE_SESSIONS.load(Ordering::Relaxed)
    }
}

impl Default for SessionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.decrement();
    }
}

/// Load bucket used when logging the gauge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadLevel {
    Normal,
    Moderate,
    High,
    Critical,
}

pub fn load_level(active: usize) -> LoadLevel {
    match active {
        n if n > CRITICAL_LOAD_THRESHOLD => LoadLevel::Critical,
        n if n > HIGH_LOAD_THRESHOLD => LoadLevel::High,
        n if n > MODERATE_LOAD_THRESHOLD => LoadLevel::Moderate,
        _ => LoadLevel::Normal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The gauge is process-global and other tests open sessions concurrently,
    // so these only assert relative movement.
    #[test]
    fn test_session_guard_manual_decrement() {
        let mut guard = SessionGuard::new();
        assert!(!guard.decremented);
        assert!(SessionGuard::active_count() >= 1);

        guard.decrement();
        assert!(guard.decremented);

        // Second decrement and the drop must not release the slot again
        guard.decrement();
        drop(guard);
    }

    #[test]
    fn test_load_level_buckets() {
        assert_eq!(load_level(0), LoadLevel::Normal);
        assert_eq!(load_level(MODERATE_LOAD_THRESHOLD), LoadLevel::Normal);
        assert_eq!(load_level(MODERATE_LOAD_THRESHOLD + 1), LoadLevel::Moderate);
        assert_eq!(load_level(HIGH_LOAD_THRESHOLD + 1), LoadLevel::High);
        assert_eq!(load_level(CRITICAL_LOAD_THRESHOLD + 1), LoadLevel::Critical);
    }
}
