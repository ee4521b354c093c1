use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Global counter for generating unique tunnel session IDs
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique session ID for log correlation
///
/// The session ID is composed of:
/// - Current timestamp (lower 48 bits of nanoseconds since UNIX epoch)
/// - Monotonic counter (lower 32 bits)
///
/// Two IDs generated in the same nanosecond still differ by counter.
pub fn new_session_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);

    format!(
        "{:x}{:08x}",
        now.as_nanos() & 0xffffffffffff,
        counter & 0xffffffff
    )
}

/// A session ID is a non-empty hex string
#[cfg(test)]
pub fn is_valid_session_id(session_id: &str) -> bool {
    !session_id.is_empty() && session_id.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_new_session_id_uniqueness() {
        let mut ids = HashSet::new();

        for _ in 0..1000 {
            let id = new_session_id();
            assert!(!ids.contains(&id), "Duplicate session ID generated: {}", id);
            ids.insert(id);
        }
    }

    #[test]
    fn test_new_session_id_format() {
        let id = new_session_id();

        assert!(is_valid_session_id(&id));
        assert!(id.len() >= 9 && id.len() <= 20);
    }

    #[test]
    fn test_is_valid_session_id() {
        assert!(is_valid_session_id("abc123def456"));
        assert!(is_valid_session_id("ABC123"));

        assert!(!is_valid_session_id(""));
        assert!(!is_valid_session_id("xyz123"));
        assert!(!is_valid_session_id("123-456"));
    }
}
