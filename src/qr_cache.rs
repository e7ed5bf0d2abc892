//! Single-slot cache for the most recent login challenge.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::time::Duration;

pub const DEFAULT_QR_TTL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QrChallenge {
    pub payload: String,
    pub issued_at: DateTime<Utc>,
}

impl QrChallenge {
    pub fn timestamp_millis(&self) -> i64 {
        self.issued_at.timestamp_millis()
    }
}

/// Holds at most one challenge. A challenge older than the TTL reads as empty
/// but stays in the slot until it is overwritten or cleared.
#[derive(Debug, Clone)]
pub struct QrCache {
    slot: Option<QrChallenge>,
    ttl: TimeDelta,
}

impl QrCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slot: None,
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
        }
    }

    pub fn record(&mut self, payload: impl Into<String>) -> QrChallenge {
        self.record_at(payload, Utc::now())
    }

    pub fn record_at(&mut self, payload: impl Into<String>, issued_at: DateTime<Utc>) -> QrChallenge {
        let challenge = QrChallenge {
            payload: payload.into(),
            issued_at,
        };
        self.slot = Some(challenge.clone());
        challenge
    }

    pub fn current(&self) -> Option<&QrChallenge> {
        self.current_at(Utc::now())
    }

    pub fn current_at(&self, now: DateTime<Utc>) -> Option<&QrChallenge> {
        self.slot
            .as_ref()
            .filter(|challenge| now.signed_duration_since(challenge.issued_at) < self.ttl)
    }

    pub fn clear(&mut self) {
        self.slot = None;
    }

    pub fn is_active(&self) -> bool {
        self.current().is_some()
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.current_at(now).is_some()
    }
}

impl Default for QrCache {
    fn default() -> Self {
        Self::new(DEFAULT_QR_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_expires_exactly_at_ttl() {
        let mut cache = QrCache::default();
        let issued = Utc::now();
        cache.record_at("2@token", issued);

        assert!(cache.is_active_at(issued));
        assert!(cache.is_active_at(issued + TimeDelta::seconds(119)));
        assert!(cache.is_active_at(issued + TimeDelta::milliseconds(119_999)));
        assert!(!cache.is_active_at(issued + TimeDelta::seconds(120)));
        assert!(!cache.is_active_at(issued + TimeDelta::seconds(600)));
    }

    #[test]
    fn record_overwrites_previous_challenge() {
        let mut cache = QrCache::new(Duration::from_secs(30));
        let issued = Utc::now();
        cache.record_at("first", issued);
        cache.record_at("second", issued + TimeDelta::seconds(10));

        let current = cache.current_at(issued + TimeDelta::seconds(35)).unwrap();
        assert_eq!(current.payload, "second");
    }

    #[test]
    fn clear_empties_a_fresh_challenge() {
        let mut cache = QrCache::default();
        cache.record("fresh");
        assert!(cache.is_active());

        cache.clear();
        assert!(!cache.is_active());
        assert!(cache.current().is_none());
    }

    #[test]
    fn timestamp_is_reported_in_millis() {
        let mut cache = QrCache::default();
        let issued = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let challenge = cache.record_at("x", issued);
        assert_eq!(challenge.timestamp_millis(), 1_700_000_000_123);
    }
}
