//! CADENCE Runtime
//!
//! Cooperative update scheduler: engines react to signals and run in
//! priority order within time-bounded passes. Timers and a priority access
//! arbiter are built on the same engine/signal graph.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arbiter;
pub mod config;
pub mod engine;
pub mod monitor;
pub mod scheduler;
pub mod signal;
pub mod timer;

pub use arbiter::ResourceArbiter;
pub use config::SchedulerConfig;
pub use engine::{CycleContext, Engine, EngineState};
pub use monitor::{Metrics, PassReport, SchedulerMonitor};
pub use scheduler::{SchedResult, Scheduler, SchedulerError};
pub use signal::RemoteSignaler;
