//! Priority keys.
//!
//! Both engine and job priorities sort ascending: the smaller key is served
//! first. Engines use a signed key so callers can derive it from structural
//! depth or from one of the named levels; jobs use an unsigned weight whose
//! floor is `0`, which is what aging promotes towards.

use serde::{Deserialize, Serialize};

/// Engine priority - smaller values cycle earlier within a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(i32);

impl Priority {
    /// Reserved for input drivers
    pub const VERY_HIGH: Self = Self(-2);
    /// Above the default
    pub const HIGH: Self = Self(-1);
    /// Default priority for new engines
    pub const DEFAULT: Self = Self(0);
    /// Below the default
    pub const LOW: Self = Self(1);
    /// Reserved for output drivers
    pub const VERY_LOW: Self = Self(2);

    /// Create from a raw key
    #[must_use]
    pub const fn new(key: i32) -> Self {
        Self(key)
    }

    /// Get the raw key
    #[must_use]
    pub const fn value(&self) -> i32 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Job priority weight - smaller weights dispatch first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobPriority(u32);

impl JobPriority {
    /// The most urgent weight; aging never promotes past it
    pub const FLOOR: Self = Self(0);

    /// Create from a raw weight
    #[must_use]
    pub const fn new(weight: u32) -> Self {
        Self(weight)
    }

    /// Get the raw weight
    #[must_use]
    pub const fn weight(&self) -> u32 {
        self.0
    }

    /// One step more urgent, saturating at [`JobPriority::FLOOR`]
    #[must_use]
    pub const fn promoted(&self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// `steps` steps more urgent, saturating at [`JobPriority::FLOOR`]
    #[must_use]
    pub fn promoted_by(&self, steps: u32) -> Self {
        Self(self.0.saturating_sub(steps))
    }

    /// Whether aging can still promote this weight
    #[must_use]
    pub const fn is_floor(&self) -> bool {
        self.0 == 0
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        Self(10)
    }
}

impl From<u32> for JobPriority {
    fn from(weight: u32) -> Self {
        Self(weight)
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "w{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_levels_sort_ascending() {
        let mut levels = vec![
            Priority::VERY_LOW,
            Priority::DEFAULT,
            Priority::VERY_HIGH,
            Priority::LOW,
            Priority::HIGH,
        ];
        levels.sort();
        assert_eq!(
            levels,
            vec![
                Priority::VERY_HIGH,
                Priority::HIGH,
                Priority::DEFAULT,
                Priority::LOW,
                Priority::VERY_LOW,
            ]
        );
    }

    #[test]
    fn test_job_priority_promotion_saturates() {
        let p = JobPriority::new(2);
        assert_eq!(p.promoted(), JobPriority::new(1));
        assert_eq!(p.promoted().promoted().promoted(), JobPriority::FLOOR);
        assert_eq!(p.promoted_by(10), JobPriority::FLOOR);
        assert!(JobPriority::FLOOR.is_floor());
    }

    #[test]
    fn test_defaults() {
        assert_eq!(Priority::default(), Priority::DEFAULT);
        assert_eq!(JobPriority::default().weight(), 10);
    }

    #[test]
    fn test_priority_serde() {
        let json = serde_json::to_string(&Priority::LOW).unwrap();
        assert_eq!(json, "1");
        let back: JobPriority = serde_json::from_str("4").unwrap();
        assert_eq!(back, JobPriority::new(4));
    }
}
