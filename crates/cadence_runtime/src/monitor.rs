//! Scheduler monitor for metrics and pass history.
//!
//! Counts what the scheduler does and keeps a bounded history of pass reports
//! for hosts that want to log or display them.

use std::collections::VecDeque;
use std::time::Duration;

use cadence_core::LogicalTime;
use serde::Serialize;

/// Scheduler counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Metrics {
    /// Completed passes
    pub passes: u64,
    /// Engine cycles run
    pub cycles: u64,
    /// Signal fires, local and remote
    pub signal_fires: u64,
    /// Fires posted from other threads
    pub remote_fires: u64,
    /// Wake-ups that changed an engine's state
    pub wake_ups: u64,
    /// `run_pass` invocations stopped by the budget
    pub budget_exhaustions: u64,
    /// Timer expirations
    pub timer_fires: u64,
}

impl Metrics {
    /// Create new metrics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Average cycles per completed pass
    #[must_use]
    pub fn cycles_per_pass(&self) -> f64 {
        if self.passes == 0 {
            return 0.0;
        }
        self.cycles as f64 / self.passes as f64
    }

    /// Reset metrics
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Outcome of one `run_pass` invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Pass number; a resumed pass keeps its number
    pub pass: u64,
    /// Cycles run by this invocation
    pub cycles: u64,
    /// Whether the pass reached the end of the ready set
    pub completed: bool,
    /// Engines left in the ready set
    pub remaining: usize,
    /// Logical clock when the invocation returned
    pub clock: LogicalTime,
    /// Wall clock time spent
    pub elapsed: Duration,
}

impl PassReport {
    /// Whether the budget cut the pass short
    #[must_use]
    pub fn was_interrupted(&self) -> bool {
        !self.completed
    }

    /// Whether nothing is left to do
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.completed && self.remaining == 0
    }
}

/// Scheduler monitor
///
/// Owned by the scheduler; readable through `Scheduler::monitor`.
#[derive(Debug)]
pub struct SchedulerMonitor {
    metrics: Metrics,
    history: VecDeque<PassReport>,
    max_history: usize,
}

impl SchedulerMonitor {
    /// Create a new monitor
    #[must_use]
    pub fn new(max_history: usize) -> Self {
        Self {
            metrics: Metrics::new(),
            history: VecDeque::with_capacity(max_history.min(1024)),
            max_history,
        }
    }

    /// Get current metrics
    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub(crate) fn metrics_mut(&mut self) -> &mut Metrics {
        &mut self.metrics
    }

    /// Record the outcome of a `run_pass` invocation
    pub(crate) fn record_pass(&mut self, report: PassReport) {
        self.metrics.cycles += report.cycles;
        if report.completed {
            self.metrics.passes += 1;
        } else {
            self.metrics.budget_exhaustions += 1;
        }

        if self.max_history == 0 {
            return;
        }
        if self.history.len() == self.max_history {
            self.history.pop_front();
        }
        self.history.push_back(report);
    }

    /// Pass reports, oldest first
    pub fn history(&self) -> impl ExactSizeIterator<Item = &PassReport> {
        self.history.iter()
    }

    /// Most recent pass report
    #[must_use]
    pub fn last_pass(&self) -> Option<&PassReport> {
        self.history.back()
    }

    /// Reset counters and history
    pub fn reset(&mut self) {
        self.metrics.reset();
        self.history.clear();
    }
}

impl Default for SchedulerMonitor {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(pass: u64, cycles: u64, completed: bool) -> PassReport {
        PassReport {
            pass,
            cycles,
            completed,
            remaining: 0,
            clock: LogicalTime::zero(),
            elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn test_record_pass_counts() {
        let mut monitor = SchedulerMonitor::new(8);
        monitor.record_pass(report(1, 4, true));
        monitor.record_pass(report(2, 3, false));
        monitor.record_pass(report(2, 1, true));

        let m = monitor.metrics();
        assert_eq!(m.passes, 2);
        assert_eq!(m.cycles, 8);
        assert_eq!(m.budget_exhaustions, 1);
        assert!((m.cycles_per_pass() - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut monitor = SchedulerMonitor::new(2);
        for pass in 1..=5 {
            monitor.record_pass(report(pass, 1, true));
        }

        let passes: Vec<u64> = monitor.history().map(|r| r.pass).collect();
        assert_eq!(passes, vec![4, 5]);
        assert_eq!(monitor.last_pass().map(|r| r.pass), Some(5));
    }

    #[test]
    fn test_zero_history_keeps_counters() {
        let mut monitor = SchedulerMonitor::new(0);
        monitor.record_pass(report(1, 2, true));
        assert_eq!(monitor.history().len(), 0);
        assert_eq!(monitor.metrics().cycles, 2);
    }

    #[test]
    fn test_reset() {
        let mut monitor = SchedulerMonitor::default();
        monitor.record_pass(report(1, 2, true));
        monitor.reset();
        assert_eq!(monitor.metrics(), &Metrics::default());
        assert!(monitor.last_pass().is_none());
    }

    #[test]
    fn test_report_flags() {
        assert!(report(1, 0, true).is_idle());
        assert!(report(1, 0, false).was_interrupted());
    }
}
