use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::hash::Hash;

/// Identity of an alert for suppression purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationKey {
    pub subscriber_id: String,
    pub site_id: String,
    pub category: String,
    pub severity: String,
}

/// Remembers when each key last fired. Check-and-set happens under the key's map entry,
/// so two racing callers cannot both see a key as expired.
#[derive(Debug)]
pub struct ExpiringMap<K: Eq + Hash> {
    fired: DashMap<K, DateTime<Utc>>,
    window: ChronoDuration,
}

impl<K: Eq + Hash + Clone> ExpiringMap<K> {
    pub fn new(window: ChronoDuration) -> Self {
        Self {
            fired: DashMap::new(),
            window,
        }
    }

    /// True, and records `now`, when the key is unseen or last fired at least one window ago.
    pub fn touch_if_expired(&self, key: &K, now: DateTime<Utc>) -> bool {
        match self.fired.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if now.signed_duration_since(*entry.get()) >= self.window {
                    entry.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    /// Drops keys whose window has passed. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.fired.len();
        self.fired
            .retain(|_, fired_at| now.signed_duration_since(*fired_at) < self.window);
        before.saturating_sub(self.fired.len())
    }

    pub fn len(&self) -> usize {
        self.fired.len()
    }

    pub fn clear(&self) {
        self.fired.clear();
    }
}

/// Suppresses repeats of the same alert inside the window.
#[derive(Debug)]
pub struct NotificationGate {
    recent: ExpiringMap<NotificationKey>,
}

impl NotificationGate {
    pub fn new(window: ChronoDuration) -> Self {
        Self {
            recent: ExpiringMap::new(window),
        }
    }

    pub fn should_emit(&self, key: &NotificationKey, now: DateTime<Utc>) -> bool {
        let emit = self.recent.touch_if_expired(key, now);
        if !emit {
            tracing::debug!(
                subscriber = %key.subscriber_id,
                site = %key.site_id,
                category = %key.category,
                severity = %key.severity,
                "suppressing duplicate notification"
            );
        }
        emit
    }

    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        self.recent.purge_expired(now)
    }

    pub fn tracked(&self) -> usize {
        self.recent.len()
    }

    pub fn clear(&self) {
        self.recent.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn key(severity: &str) -> NotificationKey {
        NotificationKey {
            subscriber_id: "u1".to_string(),
            site_id: "S1".to_string(),
            category: "temperature".to_string(),
            severity: severity.to_string(),
        }
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::minutes(minutes)
    }

    #[test]
    fn repeat_inside_window_is_suppressed() {
        let gate = NotificationGate::new(ChronoDuration::hours(1));
        assert!(gate.should_emit(&key("high"), at(0)));
        assert!(!gate.should_emit(&key("high"), at(1)));
        assert!(!gate.should_emit(&key("high"), at(59)));
        assert!(gate.should_emit(&key("high"), at(60)));
        // Window restarts from the last emission.
        assert!(!gate.should_emit(&key("high"), at(61)));
    }

    #[test]
    fn differing_key_fields_are_independent() {
        let gate = NotificationGate::new(ChronoDuration::hours(1));
        assert!(gate.should_emit(&key("high"), at(0)));
        assert!(gate.should_emit(&key("low"), at(0)));
        let mut other_site = key("high");
        other_site.site_id = "S2".to_string();
        assert!(gate.should_emit(&other_site, at(0)));
        assert_eq!(gate.tracked(), 3);
    }

    #[test]
    fn sweep_forgets_expired_keys_only() {
        let gate = NotificationGate::new(ChronoDuration::hours(1));
        gate.should_emit(&key("high"), at(0));
        gate.should_emit(&key("low"), at(30));
        assert_eq!(gate.sweep(at(65)), 1);
        assert_eq!(gate.tracked(), 1);
        assert!(!gate.should_emit(&key("low"), at(70)));
    }

    #[test]
    fn racing_callers_emit_once() {
        let gate = Arc::new(NotificationGate::new(ChronoDuration::hours(1)));
        let now = at(0);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let gate = gate.clone();
                std::thread::spawn(move || gate.should_emit(&key("high"), now))
            })
            .collect();
        let emitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|emitted| *emitted)
            .count();
        assert_eq!(emitted, 1);
    }
}
