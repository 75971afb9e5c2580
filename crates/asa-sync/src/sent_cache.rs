// SPDX-License-Identifier: MIT OR Apache-2.0
use std::collections::{HashMap, VecDeque};

/// Maximum number of `(bucket_id, event_id)` entries retained. Beyond
/// this, the oldest entry is evicted to bound memory for long-running
/// processes.
const MAX_ENTRIES: usize = 10_000;
/// Duration deltas smaller than this are considered the same
/// observation re-sent by a heartbeat extension, not a new event.
const DEDUPE_THRESHOLD_SECS: f64 = 0.5;

type CacheKey = (String, i64);

/// Bounded FIFO-eviction cache of the last duration sent for each
/// `(bucket_id, event_id)`, used to skip re-uploading events whose
/// duration has not meaningfully changed since the last cycle.
#[derive(Default)]
pub struct SentCache {
    durations: HashMap<CacheKey, f64>,
    order: VecDeque<CacheKey>,
}

impl SentCache {
    /// Build an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `duration` as sent for `key`. Returns `true` if this is a
    /// meaningfully new observation that should be uploaded, `false` if
    /// it duplicates what was already sent within [`DEDUPE_THRESHOLD_SECS`].
    pub fn observe(&mut self, bucket_id: &str, event_id: i64, duration: f64) -> bool {
        let key = (bucket_id.to_string(), event_id);
        if let Some(&cached) = self.durations.get(&key) {
            if (duration - cached).abs() < DEDUPE_THRESHOLD_SECS {
                return false;
            }
        } else {
            self.order.push_back(key.clone());
        }
        self.durations.insert(key, duration);
        self.evict_if_over_capacity();
        true
    }

    fn evict_if_over_capacity(&mut self) {
        while self.order.len() > MAX_ENTRIES {
            if let Some(oldest) = self.order.pop_front() {
                self.durations.remove(&oldest);
            }
        }
    }

    /// Number of entries currently tracked.
    pub fn len(&self) -> usize {
        self.durations.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.durations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_observation_always_sends() {
        let mut cache = SentCache::new();
        assert!(cache.observe("bw", 7, 30.0));
    }

    #[test]
    fn heartbeat_extension_within_threshold_is_skipped() {
        let mut cache = SentCache::new();
        assert!(cache.observe("bw", 7, 30.0));
        assert!(!cache.observe("bw", 7, 30.2));
    }

    #[test]
    fn meaningful_duration_change_resends() {
        let mut cache = SentCache::new();
        assert!(cache.observe("bw", 7, 30.0));
        assert!(!cache.observe("bw", 7, 30.2));
        assert!(cache.observe("bw", 7, 45.0));
    }

    #[test]
    fn evicts_oldest_past_capacity() {
        let mut cache = SentCache::new();
        for i in 0..(MAX_ENTRIES as i64 + 5) {
            cache.observe("bw", i, 1.0);
        }
        assert_eq!(cache.len(), MAX_ENTRIES);
        // the oldest keys should have been evicted, so re-observing one
        // of them with the same duration counts as new again.
        assert!(cache.observe("bw", 0, 1.0));
    }
}
