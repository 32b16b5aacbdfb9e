//! Station liveness registry.
//!
//! Maps each station id to the wall-clock time of its last contact. PUT and
//! HEARTBEAT refresh entries; the sweeper removes them; `MOST_RECENT` reads
//! resolve against them.

use std::collections::BTreeMap;
use std::time::SystemTime;

use parking_lot::Mutex;

/// Thread-safe `station id -> last contact` map.
///
/// A single mutex guards the whole map so an entry is always observed as one
/// `(id, timestamp)` pair. `BTreeMap` gives a stable iteration order, which
/// is what makes most-recent selection deterministic on ties.
#[derive(Debug, Default)]
pub struct StationRegistry {
    entries: Mutex<BTreeMap<String, SystemTime>>,
}

impl StationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records contact from `station` at the current wall time.
    pub fn touch(&self, station: &str) {
        self.touch_at(station, SystemTime::now());
    }

    /// Records contact from `station` at `at`, creating the entry if needed.
    pub fn touch_at(&self, station: &str, at: SystemTime) {
        self.entries.lock().insert(station.to_string(), at);
    }

    pub fn last_contact(&self, station: &str) -> Option<SystemTime> {
        self.entries.lock().get(station).copied()
    }

    /// Drops `station` if its last contact is before `cutoff`, checking and
    /// removing under one lock.
    ///
    /// Returns true when the station is absent afterwards, including when it
    /// had no entry to begin with.
    pub fn remove_if_stale(&self, station: &str, cutoff: SystemTime) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(station) {
            Some(last) if *last >= cutoff => false,
            Some(_) => {
                entries.remove(station);
                true
            }
            None => true,
        }
    }

    /// Resolves the station with the latest last-contact time.
    ///
    /// Ties go to the lexicographically smallest id. Returns `None` when the
    /// registry is empty.
    pub fn most_recent(&self) -> Option<String> {
        let entries = self.entries.lock();
        let mut best: Option<(&String, &SystemTime)> = None;
        for (id, at) in entries.iter() {
            match best {
                Some((_, best_at)) if at <= best_at => {}
                _ => best = Some((id, at)),
            }
        }
        best.map(|(id, _)| id.clone())
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn most_recent_on_empty_registry_is_none() {
        let registry = StationRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.most_recent(), None);
    }

    #[test]
    fn most_recent_picks_latest_contact() {
        let registry = StationRegistry::new();
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        registry.touch_at("A", base);
        registry.touch_at("B", base + Duration::from_secs(5));
        registry.touch_at("C", base + Duration::from_secs(2));

        assert_eq!(registry.most_recent().as_deref(), Some("B"));

        registry.touch_at("A", base + Duration::from_secs(9));
        assert_eq!(registry.most_recent().as_deref(), Some("A"));
    }

    #[test]
    fn most_recent_ties_resolve_to_smallest_id() {
        let registry = StationRegistry::new();
        let at = SystemTime::UNIX_EPOCH + Duration::from_secs(42);
        registry.touch_at("zulu", at);
        registry.touch_at("alpha", at);
        registry.touch_at("mike", at);

        assert_eq!(registry.most_recent().as_deref(), Some("alpha"));
    }

    #[test]
    fn remove_if_stale_keeps_refreshed_entries() {
        let registry = StationRegistry::new();
        let cutoff = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        registry.touch_at("OLD", cutoff - Duration::from_secs(1));
        registry.touch_at("EDGE", cutoff);

        assert!(registry.remove_if_stale("OLD", cutoff));
        assert_eq!(registry.last_contact("OLD"), None);
        assert!(!registry.remove_if_stale("EDGE", cutoff));
        assert!(registry.remove_if_stale("never-seen", cutoff));

        // A contact landing after the sweep computed its cutoff survives.
        registry.touch_at("OLD", cutoff + Duration::from_secs(1));
        assert!(!registry.remove_if_stale("OLD", cutoff));
        assert!(registry.last_contact("OLD").is_some());
    }

    #[test]
    fn touch_refreshes_existing_entry() {
        let registry = StationRegistry::new();
        let base = SystemTime::UNIX_EPOCH;
        registry.touch_at("S1", base);
        registry.touch_at("S1", base + Duration::from_secs(1));

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.last_contact("S1"),
            Some(base + Duration::from_secs(1))
        );
    }
}
