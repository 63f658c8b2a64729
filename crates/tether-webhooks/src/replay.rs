use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// In-memory set of recently seen signatures. `check_and_record` is atomic
/// per key: the first caller inside the TTL wins, every duplicate is a
/// replay.
pub struct ReplayStore {
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
    ttl: Duration,
}

impl ReplayStore {
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    /// Returns true when the key is fresh (and records it); false on replay.
    pub fn check_and_record(&self, key: &str) -> bool {
        let now = Utc::now();
        let mut seen = self.seen.lock();
        seen.retain(|_, expires| *expires > now);
        if seen.contains_key(key) {
            return false;
        }
        seen.insert(key.to_string(), now + self.ttl);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}

/// Event-id idempotency store (Stripe-style): duplicates are flagged rather
/// than rejected, with a longer TTL than the signature window.
pub struct EventIdStore {
    processed: Mutex<HashMap<String, DateTime<Utc>>>,
    ttl: Duration,
}

impl EventIdStore {
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            processed: Mutex::new(HashMap::new()),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    /// Returns true the first time an event id is seen inside the TTL.
    pub fn first_time(&self, event_id: &str) -> bool {
        let now = Utc::now();
        let mut processed = self.processed.lock();
        processed.retain(|_, expires| *expires > now);
        if processed.contains_key(event_id) {
            return false;
        }
        processed.insert(event_id.to_string(), now + self.ttl);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_within_ttl_is_replay() {
        let store = ReplayStore::new(60);
        assert!(store.check_and_record("sig-1"));
        assert!(!store.check_and_record("sig-1"));
        assert!(store.check_and_record("sig-2"));
    }

    #[test]
    fn expired_entries_pass_again() {
        let store = ReplayStore::new(0);
        assert!(store.check_and_record("sig-1"));
        // ttl of zero expires immediately
        assert!(store.check_and_record("sig-1"));
    }

    #[test]
    fn event_ids_are_deduplicated() {
        let store = EventIdStore::new(60);
        assert!(store.first_time("evt_1"));
        assert!(!store.first_time("evt_1"));
    }
}
