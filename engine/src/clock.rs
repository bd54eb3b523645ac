//! Modification clock for `_modified` counters.
//!
//! `_modified` doubles as a wall-clock hint (milliseconds) and as the
//! last-writer-wins tiebreaker, so it must never go backwards for a record
//! even when the system clock does.

use crate::{Modified, Timestamp};
use serde::{Deserialize, Serialize};

/// Hands out strictly increasing `_modified` values.
///
/// Each value is at least the current time, greater than the record's
/// previous counter, and greater than anything this clock issued or observed
/// before.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifiedClock {
    last: Modified,
}

impl ModifiedClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a known high-water mark.
    pub fn with_last(last: Modified) -> Self {
        Self { last }
    }

    /// The last value issued or observed.
    pub fn last(&self) -> Modified {
        self.last
    }

    /// Next counter for a record whose current counter is `previous`.
    pub fn next(&mut self, now: Timestamp, previous: Modified) -> Modified {
        let value = now
            .max(previous.saturating_add(1))
            .max(self.last.saturating_add(1));
        self.last = value;
        value
    }

    /// Raise the high-water mark after seeing a counter from elsewhere.
    pub fn observe(&mut self, seen: Modified) {
        self.last = self.last.max(seen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_clock_starts_at_zero() {
        assert_eq!(ModifiedClock::new().last(), 0);
    }

    #[test]
    fn next_follows_wall_clock() {
        let mut clock = ModifiedClock::new();
        assert_eq!(clock.next(1_000, 0), 1_000);
        assert_eq!(clock.next(2_000, 1_000), 2_000);
    }

    #[test]
    fn next_survives_clock_going_backwards() {
        let mut clock = ModifiedClock::new();
        let a = clock.next(5_000, 0);
        let b = clock.next(4_000, a);
        assert!(b > a);
    }

    #[test]
    fn next_exceeds_previous_record_counter() {
        let mut clock = ModifiedClock::new();
        assert_eq!(clock.next(10, 500), 501);
    }

    #[test]
    fn successive_calls_are_strictly_increasing() {
        let mut clock = ModifiedClock::new();
        let a = clock.next(100, 0);
        let b = clock.next(100, 0);
        let c = clock.next(100, 0);
        assert!(a < b && b < c);
    }

    #[test]
    fn observe_raises_high_water_mark() {
        let mut clock = ModifiedClock::with_last(10);
        clock.observe(50);
        assert_eq!(clock.last(), 50);
        clock.observe(20);
        assert_eq!(clock.last(), 50);
        assert_eq!(clock.next(0, 0), 51);
    }

    #[test]
    fn serialization_roundtrip() {
        let clock = ModifiedClock::with_last(42);
        let json = serde_json::to_string(&clock).unwrap();
        let parsed: ModifiedClock = serde_json::from_str(&json).unwrap();
        assert_eq!(clock, parsed);
    }
}
