//! Strongly-typed, time-ordered identifiers.
//!
//! Task ids are ULIDs generated from the run clock: the timestamp prefix
//! makes ids sort in creation order when the store iterates keys
//! lexicographically, and the random suffix makes them unique without any
//! coordination. The phantom marker keeps different id kinds from being
//! mixed up at compile time.

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

use crate::ports::Clock;

/// Marker trait tying an [`Id`] to one kind of entity.
pub trait IdMarker: Send + Sync + 'static {
    /// Prefix used in the `Display` form, and therefore in store keys.
    fn prefix() -> &'static str;
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// Fresh id: clock milliseconds plus a random suffix.
    pub fn generate(clock: &dyn Clock) -> Self {
        let millis = clock.now().timestamp_millis().max(0) as u64;
        Self::from_ulid(Ulid::from_parts(millis, rand::random()))
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

// Serialize as the bare ULID string; the prefix belongs to the Display/key
// form only.
impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.ulid.serialize(serializer)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::from_ulid(Ulid::deserialize(deserializer)?))
    }
}

/// Marker type for tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskMarker {}

impl IdMarker for TaskMarker {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Identifier of a task (the unit of scheduled, retryable work).
pub type TaskId = Id<TaskMarker>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn generated_ids_are_unique() {
        let a = TaskId::generate(&SystemClock);
        let b = TaskId::generate(&SystemClock);
        assert_ne!(a, b);
    }

    #[test]
    fn ids_sort_by_generation_time() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        let a = TaskId::generate(&clock);
        clock.advance(chrono::Duration::milliseconds(2));
        let b = TaskId::generate(&clock);
        clock.advance(chrono::Duration::milliseconds(2));
        let c = TaskId::generate(&clock);

        assert!(a < b);
        assert!(b < c);
        // The Display form is the store key, so the same order must hold
        // lexicographically.
        assert!(a.to_string() < b.to_string());
        assert!(b.to_string() < c.to_string());
    }

    #[test]
    fn display_has_prefix_but_serde_is_bare() {
        let id = TaskId::generate(&SystemClock);
        assert!(id.to_string().starts_with("task-"));

        let json = serde_json::to_string(&id).unwrap();
        assert!(!json.contains("task-"));
        let back: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn fixed_clock_pins_the_timestamp_part() {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let clock = FixedClock::new(at);
        let id = TaskId::generate(&clock);
        assert_eq!(id.as_ulid().timestamp_ms(), at.timestamp_millis() as u64);
    }
}
