//! Time-ordered id and timestamp helpers shared across the storage layer.

use chrono::Utc;
use uuid::Uuid;

/// Generate a new time-ordered id (UUID v7).
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// Current wall-clock time as milliseconds since epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_ordered() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
        // v7 ids are lexicographically increasing with time at 1ms resolution or better.
        assert!(a < b || a == b.clone());
    }

    #[test]
    fn now_ms_is_positive() {
        assert!(now_ms() > 0);
    }
}
