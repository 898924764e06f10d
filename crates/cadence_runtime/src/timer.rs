//! Timers: signals fired by the scheduler after a delay.
//!
//! All timers of a scheduler share one internal engine at
//! [`Priority::VERY_HIGH`]. It is created with the first timer and polls
//! once per pass while any timer is armed. A periodic timer is re-armed at
//! `max(due + period, now)`, so it keeps its average rate but catches up at
//! most one expiration per pass. Deadlines past the range of [`Instant`]
//! are never due.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use cadence_core::{EngineId, Priority, SignalId, TimerId};
use slotmap::SlotMap;
use tracing::{debug, trace};

use crate::engine::{CycleContext, Engine};
use crate::scheduler::{SchedResult, Scheduler, SchedulerError};

/// Shortest period of a periodic timer
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct TimerEntry {
    signal: SignalId,
    period: Option<Duration>,
    due: Option<(Instant, u64)>,
}

/// Timer arena plus the due-time queue.
#[derive(Debug, Default)]
pub(crate) struct TimerTable {
    entries: SlotMap<TimerId, TimerEntry>,
    queue: BTreeSet<(Instant, u64, TimerId)>,
    seq: u64,
    engine: Option<EngineId>,
}

impl TimerTable {
    fn arm(&mut self, id: TimerId, due: Instant) {
        let seq = self.seq;
        self.seq += 1;
        if let Some(entry) = self.entries.get_mut(id) {
            entry.due = Some((due, seq));
            self.queue.insert((due, seq, id));
        }
    }

    fn disarm(&mut self, id: TimerId) {
        if let Some(entry) = self.entries.get_mut(id) {
            if let Some((due, seq)) = entry.due.take() {
                self.queue.remove(&(due, seq, id));
            }
        }
    }

    /// Pop every timer due at `now`, re-arming periodic ones after the sweep.
    fn expire(&mut self, now: Instant) -> Vec<SignalId> {
        let mut fired = Vec::new();
        let mut rearm = Vec::new();

        while let Some(&(due, seq, id)) = self.queue.first() {
            if due > now {
                break;
            }
            self.queue.remove(&(due, seq, id));
            let Some(entry) = self.entries.get_mut(id) else {
                continue;
            };
            entry.due = None;
            fired.push(entry.signal);
            match entry.period.map(|period| due.checked_add(period)) {
                Some(Some(next)) => rearm.push((id, next.max(now))),
                Some(None) => trace!(timer = %id, "next expiration out of range, timer stopped"),
                None => {}
            }
        }

        for (id, due) in rearm {
            self.arm(id, due);
        }
        fired
    }
}

/// The engine that serves all timers of a scheduler.
struct TimerEngine;

impl Engine for TimerEngine {
    fn cycle(&mut self, ctx: &mut CycleContext<'_>) -> bool {
        ctx.service_timers(Instant::now())
    }

    fn name(&self) -> &str {
        "timer-central"
    }
}

impl Scheduler {
    /// Create a stopped timer with its own signal.
    pub fn create_timer(&mut self) -> TimerId {
        if self.timers.engine.is_none() {
            let engine = self.add_idle_engine(Priority::VERY_HIGH, TimerEngine);
            debug!(%engine, "timer engine created");
            self.timers.engine = Some(engine);
        }
        let signal = self.create_signal();
        self.timers.entries.insert(TimerEntry {
            signal,
            period: None,
            due: None,
        })
    }

    /// The signal fired when `timer` expires.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::TimerNotFound`] for a removed timer.
    pub fn timer_signal(&self, timer: TimerId) -> SchedResult<SignalId> {
        self.timers
            .entries
            .get(timer)
            .map(|entry| entry.signal)
            .ok_or(SchedulerError::TimerNotFound { timer })
    }

    /// Arm `timer` to fire after `delay`, and every `delay` after that when
    /// `periodic`. Restarting a running timer replaces its schedule.
    ///
    /// A delay too large to be represented as a deadline leaves the timer
    /// stopped.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::TimerNotFound`] for a removed timer.
    pub fn start_timer(&mut self, timer: TimerId, delay: Duration, periodic: bool) -> SchedResult<()> {
        let entry = self
            .timers
            .entries
            .get_mut(timer)
            .ok_or(SchedulerError::TimerNotFound { timer })?;
        entry.period = periodic.then(|| delay.max(MIN_PERIOD));

        self.timers.disarm(timer);
        let Some(due) = Instant::now().checked_add(delay) else {
            // Never due: leave it disarmed.
            trace!(%timer, ?delay, "timer delay out of range, not armed");
            return Ok(());
        };
        self.timers.arm(timer, due);
        trace!(%timer, ?delay, periodic, "timer started");

        if let Some(engine) = self.timers.engine {
            self.wake_up(engine)?;
        }
        Ok(())
    }

    /// Disarm `timer`. With `abort`, a fire that engines have not yet
    /// observed is withdrawn as well.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::TimerNotFound`] for a removed timer.
    pub fn stop_timer(&mut self, timer: TimerId, abort: bool) -> SchedResult<()> {
        let signal = self.timer_signal(timer)?;
        self.timers.disarm(timer);
        if abort {
            self.abort_signal(signal)?;
        }
        Ok(())
    }

    /// Whether `timer` is armed. A removed timer is not running.
    #[must_use]
    pub fn is_timer_running(&self, timer: TimerId) -> bool {
        self.timers
            .entries
            .get(timer)
            .is_some_and(|entry| entry.due.is_some())
    }

    /// Remove `timer` and its signal.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::TimerNotFound`] for a removed timer.
    pub fn remove_timer(&mut self, timer: TimerId) -> SchedResult<()> {
        self.timers.disarm(timer);
        let entry = self
            .timers
            .entries
            .remove(timer)
            .ok_or(SchedulerError::TimerNotFound { timer })?;
        self.remove_signal(entry.signal)
    }

    /// Number of live timers
    #[must_use]
    pub fn timer_count(&self) -> usize {
        self.timers.entries.len()
    }

    /// Fire expired timers; returns whether any timer is still armed.
    fn service_timers(&mut self, now: Instant) -> bool {
        let fired = self.timers.expire(now);
        for signal in fired {
            self.monitor_mut().metrics_mut().timer_fires += 1;
            // Signals of live timers are never removed behind the table's back.
            let _ = self.fire(signal);
        }
        !self.timers.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;

    #[test]
    fn test_expire_orders_by_due_time() {
        let mut signals: SlotMap<SignalId, ()> = SlotMap::with_key();
        let (sa, sb) = (signals.insert(()), signals.insert(()));

        let mut table = TimerTable::default();
        let a = table.entries.insert(TimerEntry {
            signal: sa,
            period: None,
            due: None,
        });
        let b = table.entries.insert(TimerEntry {
            signal: sb,
            period: None,
            due: None,
        });

        let now = Instant::now();
        table.arm(a, now + Duration::from_millis(20));
        table.arm(b, now + Duration::from_millis(10));

        assert!(table.expire(now).is_empty());
        assert_eq!(table.expire(now + Duration::from_millis(30)), vec![sb, sa]);
        assert!(table.queue.is_empty());
    }

    #[test]
    fn test_periodic_fires_once_per_sweep() {
        let mut signals: SlotMap<SignalId, ()> = SlotMap::with_key();
        let s = signals.insert(());

        let mut table = TimerTable::default();
        let t = table.entries.insert(TimerEntry {
            signal: s,
            period: Some(MIN_PERIOD),
            due: None,
        });
        let now = Instant::now();
        table.arm(t, now);

        // Far behind schedule: still a single expiration, re-armed at `now`.
        let late = now + Duration::from_secs(1);
        assert_eq!(table.expire(late), vec![s]);
        assert_eq!(table.queue.first().map(|&(due, _, _)| due), Some(late));
    }

    #[test]
    fn test_one_shot_timer_fires_and_stops() {
        let mut sched = Scheduler::new(SchedulerConfig::unbounded());
        let timer = sched.create_timer();
        let signal = sched.timer_signal(timer).unwrap();

        sched.start_timer(timer, Duration::ZERO, false).unwrap();
        assert!(sched.is_timer_running(timer));

        sched.run_pass().unwrap();
        assert!(!sched.is_timer_running(timer));
        assert!(sched.signal_clock(signal).is_some_and(|c| c.as_u64() > 0));
        assert_eq!(sched.monitor().metrics().timer_fires, 1);
    }

    #[test]
    fn test_periodic_timer_keeps_running() {
        let mut sched = Scheduler::new(SchedulerConfig::unbounded());
        let timer = sched.create_timer();
        sched.start_timer(timer, Duration::ZERO, true).unwrap();

        sched.run_pass().unwrap();
        assert!(sched.is_timer_running(timer));

        sched.stop_timer(timer, true).unwrap();
        assert!(!sched.is_timer_running(timer));
        let signal = sched.timer_signal(timer).unwrap();
        assert_eq!(sched.signal_clock(signal).map(|c| c.as_u64()), Some(0));
    }

    #[test]
    fn test_huge_delay_is_never_due() {
        let mut sched = Scheduler::new(SchedulerConfig::unbounded());
        let timer = sched.create_timer();

        sched.start_timer(timer, Duration::MAX, false).unwrap();
        assert!(!sched.is_timer_running(timer));
        sched.start_timer(timer, Duration::MAX, true).unwrap();
        assert!(!sched.is_timer_running(timer));

        sched.run_until_idle(4).unwrap();
        assert_eq!(sched.monitor().metrics().timer_fires, 0);
    }

    #[test]
    fn test_periodic_rearm_overflow_stops_timer() {
        let mut signals: SlotMap<SignalId, ()> = SlotMap::with_key();
        let s = signals.insert(());

        let mut table = TimerTable::default();
        let t = table.entries.insert(TimerEntry {
            signal: s,
            period: Some(Duration::MAX),
            due: None,
        });
        let now = Instant::now();
        table.arm(t, now);

        assert_eq!(table.expire(now), vec![s]);
        assert!(table.queue.is_empty());
        assert!(table.entries[t].due.is_none());
    }

    #[test]
    fn test_remove_timer() {
        let mut sched = Scheduler::new(SchedulerConfig::unbounded());
        let timer = sched.create_timer();
        let signal = sched.timer_signal(timer).unwrap();

        sched.remove_timer(timer).unwrap();
        assert_eq!(sched.timer_count(), 0);
        assert!(sched.signal_clock(signal).is_none());
        assert!(matches!(
            sched.start_timer(timer, Duration::ZERO, false),
            Err(SchedulerError::TimerNotFound { .. })
        ));
    }

    #[test]
    fn test_timers_share_one_engine() {
        let mut sched = Scheduler::new(SchedulerConfig::unbounded());
        let before = sched.engine_count();
        sched.create_timer();
        sched.create_timer();
        assert_eq!(sched.engine_count(), before + 1);
    }
}
