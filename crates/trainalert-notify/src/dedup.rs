use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use trainalert_common::types::NotifyAction;

/// Collapses repeated notifications for the same alert and action inside a window.
pub struct DedupCache {
    window: Duration,
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl DedupCache {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window: Duration::seconds(window_secs as i64),
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn key(alert_id: &str, action: NotifyAction) -> String {
        format!("{alert_id}:{action}")
    }

    /// Returns `true` if `key` was already recorded within the window of
    /// `at`; otherwise records it at `at` and returns `false`.
    pub fn check_and_record(&self, key: &str, at: DateTime<Utc>) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.retain(|_, recorded| at - *recorded < self.window);
        if seen.contains_key(key) {
            return true;
        }
        seen.insert(key.to_string(), at);
        false
    }

    pub fn len(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_within_window() {
        let dedup = DedupCache::new(300);
        let now = Utc::now();
        let key = DedupCache::key("a-1", NotifyAction::Firing);
        assert!(!dedup.check_and_record(&key, now));
        assert!(dedup.check_and_record(&key, now + Duration::seconds(10)));
    }

    #[test]
    fn action_is_part_of_the_key() {
        let dedup = DedupCache::new(300);
        let now = Utc::now();
        assert!(!dedup.check_and_record(&DedupCache::key("a-1", NotifyAction::Firing), now));
        assert!(!dedup.check_and_record(&DedupCache::key("a-1", NotifyAction::Resolved), now));
    }

    #[test]
    fn expired_entries_are_evicted() {
        let dedup = DedupCache::new(60);
        let now = Utc::now();
        let key = DedupCache::key("a-1", NotifyAction::Firing);
        assert!(!dedup.check_and_record(&key, now));
        assert!(!dedup.check_and_record(&key, now + Duration::seconds(61)));
        assert_eq!(dedup.len(), 1);
    }
}
