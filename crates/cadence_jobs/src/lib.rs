//! CADENCE Jobs
//!
//! Priority job queue running closures on a fixed pool of worker threads.
//! Long-waiting jobs are promoted by an [`AgingPolicy`]; state changes are
//! reported to a [`Scheduler`](cadence_runtime::Scheduler) through remote
//! signal fires.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aging;
pub mod config;
pub mod job;
pub mod queue;

pub use aging::AgingPolicy;
pub use config::{JobQueueConfig, NotificationMode};
pub use job::{JobContext, JobError, JobEvent, JobRef, JobState};
pub use queue::{JobQueue, QueueError};
