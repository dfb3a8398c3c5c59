use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

pub const TYPING_TTL: Duration = Duration::from_millis(2800);

/// Expiring presence table. Each key lives until its deadline unless
/// refreshed; refreshing replaces the deadline rather than stacking.
#[derive(Debug, Clone)]
pub struct TypingTable<K> {
    ttl: Duration,
    deadlines: HashMap<K, Instant>,
}

impl<K: Eq + Hash + Clone> TypingTable<K> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            deadlines: HashMap::new(),
        }
    }

    pub fn start(&mut self, key: K, now: Instant) {
        self.deadlines.insert(key, now + self.ttl);
    }

    pub fn stop(&mut self, key: &K) -> bool {
        self.deadlines.remove(key).is_some()
    }

    pub fn is_active(&self, key: &K, now: Instant) -> bool {
        self.deadlines.get(key).is_some_and(|deadline| *deadline > now)
    }

    pub fn active(&self, now: Instant) -> impl Iterator<Item = &K> + '_ {
        self.deadlines
            .iter()
            .filter(move |(_, deadline)| **deadline > now)
            .map(|(key, _)| key)
    }

    /// Drops expired keys and returns them.
    pub fn purge(&mut self, now: Instant) -> Vec<K> {
        let expired: Vec<K> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.deadlines.remove(key);
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
    }
}

impl<K: Eq + Hash + Clone> Default for TypingTable<K> {
    fn default() -> Self {
        Self::new(TYPING_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_expires_after_ttl() {
        let t0 = Instant::now();
        let mut table = TypingTable::default();
        table.start(("c", "u"), t0);
        assert!(table.is_active(&("c", "u"), t0 + Duration::from_millis(2799)));
        assert!(!table.is_active(&("c", "u"), t0 + TYPING_TTL));
        assert_eq!(table.purge(t0 + TYPING_TTL), vec![("c", "u")]);
        assert!(table.next_deadline().is_none());
    }

    #[test]
    fn refresh_restarts_rather_than_stacks() {
        let t0 = Instant::now();
        let mut table = TypingTable::new(Duration::from_secs(1));
        table.start("u", t0);
        table.start("u", t0 + Duration::from_millis(800));
        assert!(table.is_active(&"u", t0 + Duration::from_millis(1500)));
        assert!(!table.is_active(&"u", t0 + Duration::from_millis(1800)));
        assert_eq!(table.active(t0).count(), 1);
    }

    #[test]
    fn stop_removes_immediately() {
        let t0 = Instant::now();
        let mut table = TypingTable::default();
        table.start("u", t0);
        assert!(table.stop(&"u"));
        assert!(!table.is_active(&"u", t0));
        assert!(!table.stop(&"u"));
    }
}
