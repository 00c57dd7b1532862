use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

/// Generates a process-unique identifier of the form `{prefix}-{now_ns}-{counter}`.
pub fn next_id(prefix: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let value = COUNTER.fetch_add(1, Ordering::Relaxed);
    let now_ns = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("{prefix}-{now_ns}-{value}")
}

#[cfg(test)]
mod tests {
    use super::next_id;

    #[test]
    fn unit_next_id_is_unique_and_prefixed() {
        let first = next_id("evt");
        let second = next_id("evt");
        assert!(first.starts_with("evt-"));
        assert_ne!(first, second);
    }
}
