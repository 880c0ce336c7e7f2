use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// Per-key dispatch counters.
///
/// A key is promoted at most once: after [`HotnessProfile::record_hit`] has returned `true` for it,
/// further hits only count. Keys whose translation was aborted stay blocked until
/// [`HotnessProfile::reset`] (which the engine calls when the key's cache entry is evicted).
#[derive(Debug)]
pub struct HotnessProfile<K> {
    threshold: u64,
    counts: HashMap<K, u64>,
    requested: HashSet<K>,
    aborted: HashSet<K>,
}

impl<K: Eq + Hash + Clone> HotnessProfile<K> {
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold: threshold.max(1),
            counts: HashMap::new(),
            requested: HashSet::new(),
            aborted: HashSet::new(),
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn count(&self, key: &K) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// Count one dispatch of `key` and report whether it is at or above the threshold.
    pub fn should_compile(&mut self, key: &K) -> bool {
        let count = self.counts.entry(key.clone()).or_insert(0);
        *count = count.saturating_add(1);
        *count >= self.threshold
    }

    /// Count one dispatch and return `true` exactly once, when the key first becomes eligible for a
    /// compile request.
    pub fn record_hit(&mut self, key: &K, has_compiled_unit: bool) -> bool {
        let hot = self.should_compile(key);
        if !hot || has_compiled_unit || self.is_blocked(key) {
            return false;
        }
        self.requested.insert(key.clone())
    }

    /// Whether the key is queued or has already failed translation.
    pub fn is_blocked(&self, key: &K) -> bool {
        self.requested.contains(key) || self.aborted.contains(key)
    }

    pub fn mark_aborted(&mut self, key: &K) {
        self.requested.remove(key);
        self.aborted.insert(key.clone());
    }

    pub fn mark_compiled(&mut self, key: &K) {
        self.requested.remove(key);
    }

    pub fn is_aborted(&self, key: &K) -> bool {
        self.aborted.contains(key)
    }

    /// Forget everything about `key`.
    pub fn reset(&mut self, key: &K) {
        self.counts.remove(key);
        self.requested.remove(key);
        self.aborted.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_compile_flips_exactly_at_threshold() {
        let mut profile = HotnessProfile::new(3);
        assert!(!profile.should_compile(&0x1000u64));
        assert!(!profile.should_compile(&0x1000));
        assert!(profile.should_compile(&0x1000));
        assert!(profile.should_compile(&0x1000));
        assert_eq!(profile.count(&0x1000), 4);
    }

    #[test]
    fn record_hit_requests_once() {
        let mut profile = HotnessProfile::new(2);
        assert!(!profile.record_hit(&7u64, false));
        assert!(profile.record_hit(&7, false));
        assert!(!profile.record_hit(&7, false));
        profile.mark_aborted(&7);
        for _ in 0..100 {
            assert!(!profile.record_hit(&7, false));
        }
        profile.reset(&7);
        assert!(!profile.record_hit(&7, false));
        assert!(profile.record_hit(&7, false));
    }

    #[test]
    fn compiled_keys_are_not_requested() {
        let mut profile = HotnessProfile::new(1);
        assert!(!profile.record_hit(&"m".to_string(), true));
    }
}
