//! Cooperative update scheduler.
//!
//! The scheduler owns the engine and signal arenas and the ready set. Work
//! happens in passes:
//! - The ready set is a `BTreeMap` keyed by `(priority, creation serial)`, so
//!   iteration order is deterministic and ascending.
//! - A pass walks the live map with a cursor. Engines scheduled during the
//!   pass with a key after the cursor are visited in the same pass; engines
//!   at or before the cursor, and engines woken while running, wait for the
//!   next pass.
//! - Each engine cycles at most once per pass, so a pass always terminates.
//! - A pass stops early when its time or cycle budget is spent and resumes
//!   from its cursor on the next `run_pass`.
//!
//! Everything here is single-threaded. Other threads reach the graph only
//! through [`RemoteSignaler`], whose fires are applied at the start of a pass.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::rc::Rc;
use std::time::Instant;

use cadence_core::{AgentId, EngineId, LogicalTime, Priority, SignalId, TimerId};
use slotmap::SlotMap;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::SchedulerConfig;
use crate::engine::{CycleContext, Engine, EngineSlot, EngineState, ReadyKey};
use crate::monitor::{PassReport, SchedulerMonitor};
use crate::signal::{RemoteInbox, RemoteSignaler, SignalSlot};
use crate::timer::TimerTable;

/// Scheduler error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// Engine id is stale or foreign
    #[error("engine not found: {engine}")]
    EngineNotFound {
        /// The id
        engine: EngineId,
    },
    /// Signal id is stale or foreign
    #[error("signal not found: {signal}")]
    SignalNotFound {
        /// The id
        signal: SignalId,
    },
    /// Timer id is stale or foreign
    #[error("timer not found: {timer}")]
    TimerNotFound {
        /// The id
        timer: TimerId,
    },
    /// Agent id is stale or foreign
    #[error("agent not found: {agent}")]
    AgentNotFound {
        /// The id
        agent: AgentId,
    },
    /// Unlink without a matching link
    #[error("{engine} is not linked to {signal}")]
    NotLinked {
        /// The engine
        engine: EngineId,
        /// The signal
        signal: SignalId,
    },
    /// A pass was left mid-cycle by a panic
    #[error("scheduler poisoned: pass interrupted while cycling {engine}")]
    Poisoned {
        /// Engine that was running
        engine: EngineId,
    },
    /// `run_pass` called from inside a cycle
    #[error("run_pass called from inside the cycle of {engine}")]
    Reentrant {
        /// Engine whose cycle made the call
        engine: EngineId,
    },
}

/// Scheduler result type
pub type SchedResult<T> = Result<T, SchedulerError>;

/// Marks a live cycle frame until dropped, including by an unwind
struct CycleFrame(Rc<Cell<bool>>);

impl CycleFrame {
    fn enter(flag: &Rc<Cell<bool>>) -> Self {
        flag.set(true);
        Self(Rc::clone(flag))
    }
}

impl Drop for CycleFrame {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

#[derive(Debug, Default)]
struct PassState {
    /// Number of the current (or last) pass
    number: u64,
    /// Key of the last visited ready entry; `None` between passes
    cursor: Option<ReadyKey>,
    /// Start of the current `run_pass` invocation
    started: Option<Instant>,
    /// Cycles run by the current invocation
    cycles: u64,
}

/// Cooperative priority scheduler for engines and signals
///
/// Multiple schedulers may coexist; ids from one are "not found" in another
/// unless they happen to collide in slot and generation, so keep ids with
/// the scheduler that issued them.
pub struct Scheduler {
    config: SchedulerConfig,
    engines: SlotMap<EngineId, EngineSlot>,
    signals: SlotMap<SignalId, SignalSlot>,
    /// Scheduled engines, ordered by key
    ready: BTreeMap<ReadyKey, EngineId>,
    clock: LogicalTime,
    next_serial: u64,
    pass: PassState,
    /// Engine inside its cycle; left set if the cycle unwinds
    current: Option<EngineId>,
    /// Set while a cycle frame is live; cleared on return and on unwind
    cycling: Rc<Cell<bool>>,
    remote: RemoteInbox,
    pub(crate) timers: TimerTable,
    monitor: SchedulerMonitor,
}

impl Scheduler {
    /// Create a new scheduler
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        let monitor = SchedulerMonitor::new(config.history_limit);
        Self {
            config,
            engines: SlotMap::with_key(),
            signals: SlotMap::with_key(),
            ready: BTreeMap::new(),
            clock: LogicalTime::zero(),
            next_serial: 0,
            pass: PassState::default(),
            current: None,
            cycling: Rc::default(),
            remote: RemoteInbox::new(),
            timers: TimerTable::default(),
            monitor,
        }
    }

    /// Scheduler configuration
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Metrics and pass history
    #[must_use]
    pub fn monitor(&self) -> &SchedulerMonitor {
        &self.monitor
    }

    pub(crate) fn monitor_mut(&mut self) -> &mut SchedulerMonitor {
        &mut self.monitor
    }

    /// Current logical time
    #[must_use]
    pub fn clock(&self) -> LogicalTime {
        self.clock
    }

    /// Number of the current or last pass
    #[must_use]
    pub fn pass_number(&self) -> u64 {
        self.pass.number
    }

    // ------------------------------------------------------------------
    // Engines
    // ------------------------------------------------------------------

    /// Register an engine and schedule its first cycle.
    pub fn add_engine(&mut self, priority: Priority, engine: impl Engine + 'static) -> EngineId {
        let id = self.add_idle_engine(priority, engine);
        self.schedule(id);
        id
    }

    /// Register an engine without scheduling it.
    pub fn add_idle_engine(&mut self, priority: Priority, engine: impl Engine + 'static) -> EngineId {
        let serial = self.next_serial;
        self.next_serial += 1;
        let slot = EngineSlot::new(Box::new(engine), priority, serial, self.clock);
        let name = slot.name.clone();
        let id = self.engines.insert(slot);
        trace!(%id, %priority, name = %name, "engine registered");
        id
    }

    /// Unregister an engine, unlinking it from every signal and the ready
    /// set. Removing the running engine from inside its own cycle is
    /// allowed; its behavior is dropped once the cycle returns.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::EngineNotFound`] for a stale id.
    pub fn remove_engine(&mut self, engine: EngineId) -> SchedResult<()> {
        let slot = self
            .engines
            .remove(engine)
            .ok_or(SchedulerError::EngineNotFound { engine })?;

        for signal in slot.downlinks.keys() {
            if let Some(sig) = self.signals.get_mut(*signal) {
                sig.linked.swap_remove(&engine);
            }
        }
        if slot.state == EngineState::Scheduled {
            self.ready.remove(&slot.key());
        }
        trace!(%engine, name = %slot.name, "engine removed");
        Ok(())
    }

    /// Schedule `engine` for a cycle.
    ///
    /// Idempotent while scheduled. A running engine is re-scheduled for a
    /// later pass once its cycle returns.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::EngineNotFound`] for a stale id.
    pub fn wake_up(&mut self, engine: EngineId) -> SchedResult<()> {
        if !self.engines.contains_key(engine) {
            return Err(SchedulerError::EngineNotFound { engine });
        }
        self.schedule(engine);
        Ok(())
    }

    /// Change the priority of `engine`, re-keying it if scheduled.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::EngineNotFound`] for a stale id.
    pub fn set_priority(&mut self, engine: EngineId, priority: Priority) -> SchedResult<()> {
        let slot = self
            .engines
            .get_mut(engine)
            .ok_or(SchedulerError::EngineNotFound { engine })?;
        if slot.state == EngineState::Scheduled {
            self.ready.remove(&slot.key());
            slot.priority = priority;
            self.ready.insert(slot.key(), engine);
        } else {
            slot.priority = priority;
        }
        Ok(())
    }

    /// Priority of `engine`
    #[must_use]
    pub fn priority(&self, engine: EngineId) -> Option<Priority> {
        self.engines.get(engine).map(|slot| slot.priority)
    }

    /// Scheduling state of `engine`
    #[must_use]
    pub fn engine_state(&self, engine: EngineId) -> Option<EngineState> {
        self.engines.get(engine).map(|slot| slot.state)
    }

    /// Whether `engine` is registered
    #[must_use]
    pub fn contains_engine(&self, engine: EngineId) -> bool {
        self.engines.contains_key(engine)
    }

    /// Number of registered engines
    #[must_use]
    pub fn engine_count(&self) -> usize {
        self.engines.len()
    }

    /// Number of scheduled engines
    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Engine in its cycle, if any
    #[must_use]
    pub fn current_engine(&self) -> Option<EngineId> {
        self.current.filter(|_| self.cycling.get())
    }

    // ------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------

    /// Create a signal with no links.
    pub fn create_signal(&mut self) -> SignalId {
        self.signals.insert(SignalSlot::default())
    }

    /// Remove a signal and every link to it.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::SignalNotFound`] for a stale id.
    pub fn remove_signal(&mut self, signal: SignalId) -> SchedResult<()> {
        let slot = self
            .signals
            .remove(signal)
            .ok_or(SchedulerError::SignalNotFound { signal })?;
        for engine in slot.linked {
            if let Some(e) = self.engines.get_mut(engine) {
                e.downlinks.swap_remove(&signal);
            }
        }
        Ok(())
    }

    /// Fire `signal`: advance the clock and schedule every linked engine
    /// that is not already scheduled. Linked engines that are running are
    /// serviced in a later pass.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::SignalNotFound`] for a stale id.
    pub fn fire(&mut self, signal: SignalId) -> SchedResult<()> {
        let time = self.clock.tick();
        let Self {
            signals,
            engines,
            ready,
            monitor,
            ..
        } = self;
        let slot = signals
            .get_mut(signal)
            .ok_or(SchedulerError::SignalNotFound { signal })?;
        slot.clock = time;
        slot.fires += 1;
        monitor.metrics_mut().signal_fires += 1;

        for &engine in &slot.linked {
            if schedule_in(engines, ready, engine) {
                monitor.metrics_mut().wake_ups += 1;
            }
        }
        Ok(())
    }

    /// Withdraw the latest fire of `signal`: no engine sees it signaled
    /// until it fires again. Engines already scheduled by it stay
    /// scheduled.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::SignalNotFound`] for a stale id.
    pub fn abort_signal(&mut self, signal: SignalId) -> SchedResult<()> {
        let slot = self
            .signals
            .get_mut(signal)
            .ok_or(SchedulerError::SignalNotFound { signal })?;
        slot.clock = LogicalTime::zero();
        Ok(())
    }

    /// Logical time of the latest fire of `signal` (zero if never fired)
    #[must_use]
    pub fn signal_clock(&self, signal: SignalId) -> Option<LogicalTime> {
        self.signals.get(signal).map(|slot| slot.clock)
    }

    /// Total fires of `signal`
    #[must_use]
    pub fn fire_count(&self, signal: SignalId) -> Option<u64> {
        self.signals.get(signal).map(|slot| slot.fires)
    }

    /// Engines linked to `signal`, in link order
    pub fn linked_engines(&self, signal: SignalId) -> impl Iterator<Item = EngineId> + '_ {
        self.signals
            .get(signal)
            .into_iter()
            .flat_map(|slot| slot.linked.iter().copied())
    }

    /// Number of registered signals
    #[must_use]
    pub fn signal_count(&self) -> usize {
        self.signals.len()
    }

    /// Link `engine` to `signal`. Links are counted: linking twice needs two
    /// unlinks.
    ///
    /// # Errors
    ///
    /// Returns `EngineNotFound` or `SignalNotFound` for stale ids.
    pub fn link(&mut self, engine: EngineId, signal: SignalId) -> SchedResult<()> {
        let sig = self
            .signals
            .get_mut(signal)
            .ok_or(SchedulerError::SignalNotFound { signal })?;
        let slot = self
            .engines
            .get_mut(engine)
            .ok_or(SchedulerError::EngineNotFound { engine })?;

        let count = slot.downlinks.entry(signal).or_insert(0);
        *count += 1;
        if *count == 1 {
            sig.linked.insert(engine);
        }
        Ok(())
    }

    /// Remove one link between `engine` and `signal`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotLinked`] if no link is outstanding, or a
    /// not-found error for stale ids.
    pub fn unlink(&mut self, engine: EngineId, signal: SignalId) -> SchedResult<()> {
        let sig = self
            .signals
            .get_mut(signal)
            .ok_or(SchedulerError::SignalNotFound { signal })?;
        let slot = self
            .engines
            .get_mut(engine)
            .ok_or(SchedulerError::EngineNotFound { engine })?;

        let count = slot
            .downlinks
            .get_mut(&signal)
            .ok_or(SchedulerError::NotLinked { engine, signal })?;
        *count -= 1;
        if *count == 0 {
            slot.downlinks.swap_remove(&signal);
            sig.linked.swap_remove(&engine);
        }
        Ok(())
    }

    /// Outstanding links between `engine` and `signal`
    #[must_use]
    pub fn link_count(&self, engine: EngineId, signal: SignalId) -> u32 {
        self.engines
            .get(engine)
            .and_then(|slot| slot.downlinks.get(&signal).copied())
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Cross-thread fires
    // ------------------------------------------------------------------

    /// A handle other threads use to fire signals of this scheduler.
    #[must_use]
    pub fn remote_signaler(&self) -> RemoteSignaler {
        self.remote.signaler()
    }

    /// Number of remote fires waiting to be applied
    #[must_use]
    pub fn pending_remote_fires(&self) -> usize {
        self.remote.pending()
    }

    /// Apply every posted remote fire now. `run_pass` does this itself.
    pub fn drain_remote_fires(&mut self) -> usize {
        let mut applied = 0;
        while let Some(signal) = self.remote.try_recv() {
            match self.fire(signal) {
                Ok(()) => {
                    applied += 1;
                    self.monitor.metrics_mut().remote_fires += 1;
                }
                Err(_) => trace!(%signal, "remote fire for removed signal dropped"),
            }
        }
        applied
    }

    // ------------------------------------------------------------------
    // Passes
    // ------------------------------------------------------------------

    /// Whether nothing is scheduled and no remote fire is pending
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.remote.pending() == 0
    }

    /// Whether the running `run_pass` invocation has spent its budget.
    ///
    /// Outside a pass this is `false`.
    #[must_use]
    pub fn is_pass_at_end(&self) -> bool {
        let Some(started) = self.pass.started else {
            return false;
        };
        if self
            .config
            .max_cycles_per_pass
            .is_some_and(|max| self.pass.cycles >= max)
        {
            return true;
        }
        self.config
            .time_budget
            .is_some_and(|budget| started.elapsed() >= budget)
    }

    /// Run scheduled engines in priority order until the ready set has no
    /// entry after the cursor or the budget is spent.
    ///
    /// At least one cycle runs per invocation when anything is scheduled,
    /// so a tiny budget still makes progress.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Reentrant`] when called from inside a
    /// cycle, and [`SchedulerError::Poisoned`] if an earlier pass was left
    /// mid-cycle by a panic.
    pub fn run_pass(&mut self) -> SchedResult<PassReport> {
        if let Some(engine) = self.current {
            if self.cycling.get() {
                debug!(%engine, "nested run_pass rejected");
                return Err(SchedulerError::Reentrant { engine });
            }
            return Err(SchedulerError::Poisoned { engine });
        }

        let started = Instant::now();
        self.drain_remote_fires();

        if self.pass.cursor.is_none() {
            self.pass.number += 1;
        }
        self.pass.started = Some(started);
        self.pass.cycles = 0;

        let pass = self.pass.number;
        let mut completed = true;

        loop {
            let next = match self.pass.cursor {
                Some(cursor) => self.ready.range((Excluded(cursor), Unbounded)).next(),
                None => self.ready.iter().next(),
            };
            let Some((&key, &engine)) = next else {
                break;
            };

            if self.pass.cycles > 0 && self.is_pass_at_end() {
                completed = false;
                break;
            }
            self.pass.cursor = Some(key);

            let cycled = self
                .engines
                .get(engine)
                .is_some_and(|slot| slot.last_pass == pass);
            if cycled {
                // Re-keyed past the cursor after cycling; next pass.
                continue;
            }

            self.ready.remove(&key);
            self.run_cycle(engine, pass);
            self.pass.cycles += 1;
        }

        if completed {
            self.pass.cursor = None;
        } else {
            debug!(pass, cycles = self.pass.cycles, "pass budget exhausted");
        }
        self.pass.started = None;

        let report = PassReport {
            pass,
            cycles: self.pass.cycles,
            completed,
            remaining: self.ready.len(),
            clock: self.clock,
            elapsed: started.elapsed(),
        };
        trace!(pass, cycles = report.cycles, remaining = report.remaining, "pass finished");
        self.monitor.record_pass(report.clone());
        Ok(report)
    }

    /// Run passes until nothing is scheduled or `max_passes` ran.
    ///
    /// # Errors
    ///
    /// Propagates [`Scheduler::run_pass`] errors.
    pub fn run_until_idle(&mut self, max_passes: usize) -> SchedResult<usize> {
        for ran in 0..max_passes {
            if self.is_idle() {
                return Ok(ran);
            }
            self.run_pass()?;
        }
        if !self.is_idle() {
            warn!(max_passes, ready = self.ready.len(), "scheduler still busy after pass limit");
        }
        Ok(max_passes)
    }

    fn run_cycle(&mut self, engine: EngineId, pass: u64) {
        let now = self.clock.tick();
        let Some(slot) = self.engines.get_mut(engine) else {
            return;
        };
        let Some(mut behavior) = slot.behavior.take() else {
            return;
        };
        slot.state = EngineState::Running;
        slot.wake_pending = false;
        slot.last_pass = pass;
        slot.prev_clock = slot.clock;
        slot.clock = now;
        let prev_clock = slot.prev_clock;

        self.current = Some(engine);
        let keep = {
            let _frame = CycleFrame::enter(&self.cycling);
            let mut ctx = CycleContext::new(self, engine, prev_clock, now);
            behavior.cycle(&mut ctx)
        };
        self.current = None;

        let Some(slot) = self.engines.get_mut(engine) else {
            trace!(%engine, "engine removed during its own cycle");
            return;
        };
        slot.behavior = Some(behavior);
        if keep || slot.wake_pending {
            slot.wake_pending = false;
            slot.state = EngineState::Scheduled;
            self.ready.insert(slot.key(), engine);
        } else {
            slot.state = EngineState::Idle;
        }
    }

    fn schedule(&mut self, engine: EngineId) {
        if schedule_in(&mut self.engines, &mut self.ready, engine) {
            self.monitor.metrics_mut().wake_ups += 1;
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("engines", &self.engines.len())
            .field("signals", &self.signals.len())
            .field("ready", &self.ready.len())
            .field("clock", &self.clock)
            .field("pass", &self.pass.number)
            .finish_non_exhaustive()
    }
}

/// Move `engine` towards `Scheduled`; returns whether its state changed.
fn schedule_in(
    engines: &mut SlotMap<EngineId, EngineSlot>,
    ready: &mut BTreeMap<ReadyKey, EngineId>,
    engine: EngineId,
) -> bool {
    let Some(slot) = engines.get_mut(engine) else {
        return false;
    };
    match slot.state {
        EngineState::Scheduled => false,
        EngineState::Running => !std::mem::replace(&mut slot.wake_pending, true),
        EngineState::Idle => {
            slot.state = EngineState::Scheduled;
            ready.insert(slot.key(), engine);
            true
        }
    }
}
