//! CADENCE Core Types
//!
//! This crate contains the plain types shared by the scheduler and the job
//! queue: generation-checked arena ids, priorities, logical time and the weak
//! back-reference registry. Nothing here touches threads or I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod id;
pub mod priority;
pub mod time;
pub mod weak;

// Re-exports
pub use error::{CoreError, CoreResult};
pub use id::{AgentId, EngineId, JobId, SignalId, TimerId};
pub use priority::{JobPriority, Priority};
pub use time::LogicalTime;
pub use weak::{WeakHandle, WeakRegistry};
