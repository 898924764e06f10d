//! Time types for CADENCE.
//!
//! The scheduler keeps a logical clock that advances on every signal fire and
//! every cycle start. Comparing a signal's clock with an engine's clock tells
//! whether the signal fired since the engine last ran. Wall clock time is only
//! used for pass budgets and timers.

use serde::{Deserialize, Serialize};

/// Logical time - monotonically increasing counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalTime(u64);

impl LogicalTime {
    /// Create a new logical time at zero
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Create from raw value
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Get raw value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Advance by one tick and return the new time
    pub fn tick(&mut self) -> Self {
        self.0 = self.0.saturating_add(1);
        *self
    }

    /// Whether `self` lies strictly between `after` and `before`
    #[must_use]
    pub fn is_between(&self, after: LogicalTime, before: LogicalTime) -> bool {
        after < *self && *self < before
    }
}

impl Default for LogicalTime {
    fn default() -> Self {
        Self::zero()
    }
}

impl std::fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T{}", self.0)
    }
}

impl From<u64> for LogicalTime {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Serde adapter storing a [`Duration`](std::time::Duration) as whole milliseconds.
///
/// Use with `#[serde(with = "cadence_core::time::duration_ms")]`.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize as milliseconds
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialize from milliseconds
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Like [`duration_ms`] for optional durations; `null` means "none".
pub mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize as milliseconds or `null`
    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize from milliseconds or `null`
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_time_tick() {
        let mut t = LogicalTime::zero();
        assert_eq!(t.as_u64(), 0);

        let t1 = t.tick();
        assert_eq!(t1.as_u64(), 1);
        assert_eq!(t, t1);
    }

    #[test]
    fn test_logical_time_saturates() {
        let mut t = LogicalTime::from_raw(u64::MAX);
        assert_eq!(t.tick().as_u64(), u64::MAX);
    }

    #[test]
    fn test_is_between_is_exclusive() {
        let a = LogicalTime::from_raw(2);
        let b = LogicalTime::from_raw(5);

        assert!(LogicalTime::from_raw(3).is_between(a, b));
        assert!(!a.is_between(a, b));
        assert!(!b.is_between(a, b));
    }

    #[test]
    fn test_duration_ms_serde() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Window {
            #[serde(with = "duration_ms")]
            every: std::time::Duration,
            #[serde(with = "option_duration_ms")]
            budget: Option<std::time::Duration>,
        }

        let w = Window {
            every: std::time::Duration::from_millis(250),
            budget: None,
        };
        let json = serde_json::to_string(&w).unwrap();
        assert_eq!(json, r#"{"every":250,"budget":null}"#);

        let back: Window = serde_json::from_str(r#"{"every":5,"budget":40}"#).unwrap();
        assert_eq!(back.every, std::time::Duration::from_millis(5));
        assert_eq!(back.budget, Some(std::time::Duration::from_millis(40)));
    }

    #[test]
    fn test_display() {
        assert_eq!(LogicalTime::from(7).to_string(), "T7");
    }
}
