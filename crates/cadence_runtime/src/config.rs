//! Scheduler configuration.

use std::time::Duration;

use cadence_core::time::{duration_ms, option_duration_ms};
use cadence_core::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

/// Budget and bookkeeping settings for a [`Scheduler`](crate::Scheduler).
///
/// Durations are written as milliseconds in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Wall clock budget of one `run_pass` invocation
    #[serde(with = "option_duration_ms")]
    pub time_budget: Option<Duration>,
    /// Maximum cycles in one `run_pass` invocation
    pub max_cycles_per_pass: Option<u64>,
    /// Interval at which a host loop calls `run_pass`
    #[serde(with = "duration_ms")]
    pub slice_interval: Duration,
    /// Pass reports kept by the monitor
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            time_budget: Some(Duration::from_millis(50)),
            max_cycles_per_pass: None,
            slice_interval: Duration::from_millis(10),
            history_limit: 64,
        }
    }
}

impl SchedulerConfig {
    /// Configuration without any pass budget
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            time_budget: None,
            max_cycles_per_pass: None,
            ..Self::default()
        }
    }

    /// Set the wall clock budget
    #[must_use]
    pub fn with_time_budget(mut self, budget: Option<Duration>) -> Self {
        self.time_budget = budget;
        self
    }

    /// Set the cycle budget
    #[must_use]
    pub fn with_max_cycles_per_pass(mut self, max: Option<u64>) -> Self {
        self.max_cycles_per_pass = max;
        self
    }

    /// Set the host loop interval
    #[must_use]
    pub fn with_slice_interval(mut self, interval: Duration) -> Self {
        self.slice_interval = interval;
        self
    }

    /// Set how many pass reports the monitor keeps
    #[must_use]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Check the configuration for values the scheduler cannot honor.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] for a zero cycle budget or a zero
    /// slice interval.
    pub fn validate(&self) -> CoreResult<()> {
        if self.max_cycles_per_pass == Some(0) {
            return Err(CoreError::validation(
                "max_cycles_per_pass",
                "must be at least 1 when set",
            ));
        }
        if self.slice_interval.is_zero() {
            return Err(CoreError::validation("slice_interval", "must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.time_budget, Some(Duration::from_millis(50)));
    }

    #[test]
    fn test_zero_cycle_budget_rejected() {
        let config = SchedulerConfig::default().with_max_cycles_per_pass(Some(0));
        assert!(matches!(
            config.validate(),
            Err(CoreError::Validation { .. })
        ));
    }

    #[test]
    fn test_zero_slice_rejected() {
        let config = SchedulerConfig::default().with_slice_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"time_budget": null, "max_cycles_per_pass": 8}"#).unwrap();
        assert_eq!(config.time_budget, None);
        assert_eq!(config.max_cycles_per_pass, Some(8));
        assert_eq!(config.slice_interval, Duration::from_millis(10));
        assert_eq!(config.history_limit, 64);
    }

    #[test]
    fn test_unbounded() {
        let config = SchedulerConfig::unbounded();
        assert!(config.time_budget.is_none());
        assert!(config.max_cycles_per_pass.is_none());
    }
}
