//! Engines: schedulable units of recomputation.
//!
//! An engine is anything implementing [`Engine`]. The scheduler stores it in
//! its arena next to the bookkeeping in [`EngineSlot`] (priority, state,
//! signal links, clocks) and hands it a [`CycleContext`] each time it runs.
//!
//! ## Lifecycle
//! ```text
//!            wake_up / linked signal fires
//!   Idle ───────────────────────────────────► Scheduled
//!    ▲                                           │ reached by the pass cursor
//!    │ cycle() == false                          ▼
//!    └─────────────────────────────────────── Running
//!                 cycle() == true or woken while running
//!                 ──► Scheduled (serviced in a later pass)
//! ```

use std::ops::{Deref, DerefMut};

use cadence_core::{EngineId, LogicalTime, Priority, SignalId};
use indexmap::IndexMap;

use crate::scheduler::Scheduler;

/// The work callback of a schedulable unit.
///
/// `cycle` must not block. It may wake engines, fire signals, change links or
/// register new engines through the context; all of those only enqueue work,
/// nothing runs inline. Returning `true` keeps the engine scheduled for the
/// next pass, `false` lets it fall asleep unless it was woken during the
/// call.
pub trait Engine {
    /// Run one unit of work.
    fn cycle(&mut self, ctx: &mut CycleContext<'_>) -> bool;

    /// Name used in logs.
    fn name(&self) -> &str {
        "engine"
    }
}

impl<F> Engine for F
where
    F: FnMut(&mut CycleContext<'_>) -> bool,
{
    fn cycle(&mut self, ctx: &mut CycleContext<'_>) -> bool {
        self(ctx)
    }
}

/// Scheduling state of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    /// Not in the ready set
    Idle,
    /// Waiting in the ready set
    Scheduled,
    /// Inside its own cycle
    Running,
}

/// Ordering key of the ready set: priority first, then creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ReadyKey {
    pub(crate) priority: Priority,
    pub(crate) serial: u64,
}

/// Arena entry for one engine.
pub(crate) struct EngineSlot {
    /// Taken out while the engine runs.
    pub(crate) behavior: Option<Box<dyn Engine>>,
    pub(crate) name: String,
    pub(crate) priority: Priority,
    pub(crate) serial: u64,
    pub(crate) state: EngineState,
    /// Woken while running; re-queued once the cycle returns.
    pub(crate) wake_pending: bool,
    /// Signal -> number of outstanding links.
    pub(crate) downlinks: IndexMap<SignalId, u32>,
    /// Clock at the start of the previous cycle.
    pub(crate) prev_clock: LogicalTime,
    /// Clock at the start of the latest cycle.
    pub(crate) clock: LogicalTime,
    /// Pass in which the engine last cycled.
    pub(crate) last_pass: u64,
}

impl EngineSlot {
    pub(crate) fn new(
        behavior: Box<dyn Engine>,
        priority: Priority,
        serial: u64,
        clock: LogicalTime,
    ) -> Self {
        Self {
            name: behavior.name().to_string(),
            behavior: Some(behavior),
            priority,
            serial,
            state: EngineState::Idle,
            wake_pending: false,
            downlinks: IndexMap::new(),
            prev_clock: clock,
            clock,
            last_pass: 0,
        }
    }

    pub(crate) fn key(&self) -> ReadyKey {
        ReadyKey {
            priority: self.priority,
            serial: self.serial,
        }
    }
}

/// Access to the scheduler from inside a cycle.
///
/// Dereferences to [`Scheduler`], so every scheduler operation is available;
/// the extra methods here are relative to the running engine.
pub struct CycleContext<'a> {
    scheduler: &'a mut Scheduler,
    engine: EngineId,
    prev_clock: LogicalTime,
    clock: LogicalTime,
}

impl<'a> CycleContext<'a> {
    pub(crate) fn new(
        scheduler: &'a mut Scheduler,
        engine: EngineId,
        prev_clock: LogicalTime,
        clock: LogicalTime,
    ) -> Self {
        Self {
            scheduler,
            engine,
            prev_clock,
            clock,
        }
    }

    /// Id of the running engine
    #[must_use]
    pub fn engine_id(&self) -> EngineId {
        self.engine
    }

    /// Ask to run again in a later pass.
    pub fn wake_self(&mut self) {
        // The running engine is always present until it removes itself.
        let _ = self.scheduler.wake_up(self.engine);
    }

    /// Whether `signal` fired between the start of this engine's previous
    /// cycle and the start of the current one.
    ///
    /// Fires that happen during the current cycle are reported by the next
    /// cycle instead.
    #[must_use]
    pub fn is_signaled(&self, signal: SignalId) -> bool {
        self.scheduler
            .signal_clock(signal)
            .is_some_and(|fired| fired.is_between(self.prev_clock, self.clock))
    }

    /// Link the running engine to `signal`.
    pub fn listen(&mut self, signal: SignalId) -> crate::SchedResult<()> {
        self.scheduler.link(self.engine, signal)
    }

    /// Remove one link between the running engine and `signal`.
    pub fn unlisten(&mut self, signal: SignalId) -> crate::SchedResult<()> {
        self.scheduler.unlink(self.engine, signal)
    }

    /// Whether the current pass has used up its budget.
    #[must_use]
    pub fn is_pass_at_end(&self) -> bool {
        self.scheduler.is_pass_at_end()
    }
}

impl Deref for CycleContext<'_> {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        self.scheduler
    }
}

impl DerefMut for CycleContext<'_> {
    fn deref_mut(&mut self) -> &mut Scheduler {
        self.scheduler
    }
}
