//! Job queue configuration.

use cadence_core::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

use crate::aging::AgingPolicy;

/// Which signals a queue fires on job state changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationMode {
    /// Fire nothing; poll the job handles instead
    None,
    /// Fire one queue-wide signal
    #[default]
    PerQueue,
    /// Fire the signal given to each job at submission
    PerJob,
}

/// Job queue configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobQueueConfig {
    /// Worker threads, i.e. the maximum number of concurrently running jobs
    pub worker_slots: usize,
    /// Promotion of long-waiting jobs
    pub aging: AgingPolicy,
    /// Signals fired on state changes
    pub notification: NotificationMode,
    /// Worker threads are named `{prefix}-{slot}`
    pub thread_name_prefix: String,
    /// Terminal-state notices kept until drained; the oldest go first, and
    /// 0 keeps none
    pub event_limit: usize,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            worker_slots: 2,
            aging: AgingPolicy::default(),
            notification: NotificationMode::default(),
            thread_name_prefix: "cadence-job".to_string(),
            event_limit: 1024,
        }
    }
}

impl JobQueueConfig {
    /// Set the number of worker slots
    #[must_use]
    pub fn with_worker_slots(mut self, slots: usize) -> Self {
        self.worker_slots = slots;
        self
    }

    /// Set the aging policy
    #[must_use]
    pub fn with_aging(mut self, aging: AgingPolicy) -> Self {
        self.aging = aging;
        self
    }

    /// Set the notification mode
    #[must_use]
    pub fn with_notification(mut self, notification: NotificationMode) -> Self {
        self.notification = notification;
        self
    }

    /// Set the worker thread name prefix
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set how many undrained job events are kept
    #[must_use]
    pub fn with_event_limit(mut self, limit: usize) -> Self {
        self.event_limit = limit;
        self
    }

    /// Check the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] for zero worker slots or a zero
    /// aging threshold.
    pub fn validate(&self) -> CoreResult<()> {
        if self.worker_slots == 0 {
            return Err(CoreError::validation("worker_slots", "must be at least 1"));
        }
        if !matches!(self.aging, AgingPolicy::Disabled) && !self.aging.is_enabled() {
            return Err(CoreError::validation("aging", "threshold must be non-zero"));
        }
        Ok(())
    }
}
