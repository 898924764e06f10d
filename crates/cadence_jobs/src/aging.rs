//! Aging: promote jobs that wait too long.
//!
//! A pending job's effective priority is its submitted weight minus one step
//! per aging threshold it has waited through, saturating at
//! [`JobPriority::FLOOR`]. The queue breaks ties by submission order, so a
//! job that reached the floor is passed only by older floor jobs. That bounds
//! how long any job can wait: at most `weight * threshold` of promotion
//! followed by the floor jobs that were ahead of it.
//!
//! The queue does not rescan every pending job per dispatch. Each job keeps
//! the [`Promotion`] point of its next step, and only jobs whose point has
//! passed are re-keyed.

use std::time::{Duration, Instant};

use cadence_core::JobPriority;
use cadence_core::time::duration_ms;
use serde::{Deserialize, Serialize};

/// How waiting time is measured for promotion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgingPolicy {
    /// Never promote
    Disabled,
    /// One step per `every` dispatches that happened while the job waited
    Dispatches {
        /// Dispatches per step
        every: u32,
    },
    /// One step per `every` of wall clock waiting time
    Elapsed {
        /// Waiting time per step, in milliseconds in configuration files
        #[serde(with = "duration_ms")]
        every: Duration,
    },
}

impl Default for AgingPolicy {
    fn default() -> Self {
        Self::Dispatches { every: 4 }
    }
}

impl AgingPolicy {
    /// Effective priority of a job submitted with `base` that has waited
    /// through `dispatches` dispatches and `waited` time.
    #[must_use]
    pub fn effective(&self, base: JobPriority, dispatches: u64, waited: Duration) -> JobPriority {
        let steps = match *self {
            Self::Disabled => 0,
            Self::Dispatches { every } if every > 0 => dispatches / u64::from(every),
            Self::Elapsed { every } if !every.is_zero() => {
                u64::try_from(waited.as_nanos() / every.as_nanos()).unwrap_or(u64::MAX)
            }
            // zero thresholds are rejected by config validation
            _ => 0,
        };
        base.promoted_by(u32::try_from(steps).unwrap_or(u32::MAX))
    }

    /// Point at which a job submitted with `base` at dispatch count `mark`
    /// and time `since`, now ranked `effective`, gains its next step.
    ///
    /// `None` once the job is at the floor, when the policy never promotes,
    /// or when the point lies beyond the counter or clock range.
    pub(crate) fn next_promotion(
        &self,
        base: JobPriority,
        effective: JobPriority,
        mark: u64,
        since: Instant,
    ) -> Option<Promotion> {
        if effective.is_floor() || !self.is_enabled() {
            return None;
        }
        let next = u64::from(base.weight().saturating_sub(effective.weight())) + 1;
        match *self {
            Self::Disabled => None,
            Self::Dispatches { every } => u64::from(every)
                .checked_mul(next)
                .and_then(|span| mark.checked_add(span))
                .map(Promotion::Dispatch),
            Self::Elapsed { every } => u32::try_from(next)
                .ok()
                .and_then(|next| every.checked_mul(next))
                .and_then(|span| since.checked_add(span))
                .map(Promotion::At),
        }
    }

    /// Whether this policy can ever promote a job
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        match self {
            Self::Disabled => false,
            Self::Dispatches { every } => *every > 0,
            Self::Elapsed { every } => !every.is_zero(),
        }
    }
}

/// Dispatch count or instant at which a pending job's next aging step lands
///
/// A queue uses one policy, so all its points share a variant and sort in
/// the order they come due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Promotion {
    Dispatch(u64),
    At(Instant),
}

impl Promotion {
    /// Whether the point has been reached
    pub(crate) fn is_due(&self, dispatches: u64, now: Instant) -> bool {
        match *self {
            Self::Dispatch(at) => dispatches >= at,
            Self::At(at) => now >= at,
        }
    }
}
