//! Signals and the cross-thread fire handoff.
//!
//! A signal is a clock plus the set of engines linked to it. Firing advances
//! the clock and schedules every linked engine; the scheduler owns both
//! arenas, so the operations live on [`Scheduler`](crate::Scheduler). This
//! module holds the arena entry and [`RemoteSignaler`], the only part of the
//! graph that may be touched from another thread.

use cadence_core::{EngineId, LogicalTime, SignalId};
use crossbeam_channel::{Receiver, Sender};
use indexmap::IndexSet;

/// Arena entry for one signal.
#[derive(Debug, Default)]
pub(crate) struct SignalSlot {
    /// Logical time of the latest fire
    pub(crate) clock: LogicalTime,
    /// Linked engines in link order
    pub(crate) linked: IndexSet<EngineId>,
    pub(crate) fires: u64,
}

/// Thread-safe handle that posts signal fires to a scheduler.
///
/// Posted fires are applied by the scheduler thread at the start of its next
/// pass (or by `Scheduler::drain_remote_fires`). Firing a signal that was
/// removed in the meantime is silently ignored.
#[derive(Debug, Clone)]
pub struct RemoteSignaler {
    tx: Sender<SignalId>,
}

impl RemoteSignaler {
    /// Post a fire of `signal`.
    ///
    /// Returns `false` once the scheduler is gone.
    pub fn fire(&self, signal: SignalId) -> bool {
        // unbounded, so this never blocks
        self.tx.send(signal).is_ok()
    }
}

/// Receiving side kept by the scheduler.
#[derive(Debug)]
pub(crate) struct RemoteInbox {
    tx: Sender<SignalId>,
    rx: Receiver<SignalId>,
}

impl RemoteInbox {
    pub(crate) fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    pub(crate) fn signaler(&self) -> RemoteSignaler {
        RemoteSignaler {
            tx: self.tx.clone(),
        }
    }

    pub(crate) fn try_recv(&self) -> Option<SignalId> {
        self.rx.try_recv().ok()
    }

    pub(crate) fn pending(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn test_remote_fires_arrive_in_order() {
        let mut arena: SlotMap<SignalId, ()> = SlotMap::with_key();
        let a = arena.insert(());
        let b = arena.insert(());

        let inbox = RemoteInbox::new();
        let signaler = inbox.signaler();
        let worker = std::thread::spawn(move || {
            assert!(signaler.fire(a));
            assert!(signaler.fire(b));
        });
        worker.join().unwrap();

        assert_eq!(inbox.pending(), 2);
        assert_eq!(inbox.try_recv(), Some(a));
        assert_eq!(inbox.try_recv(), Some(b));
        assert_eq!(inbox.try_recv(), None);
    }

    #[test]
    fn test_fire_after_inbox_dropped() {
        let mut arena: SlotMap<SignalId, ()> = SlotMap::with_key();
        let id = arena.insert(());

        let inbox = RemoteInbox::new();
        let signaler = inbox.signaler();
        drop(inbox);
        assert!(!signaler.fire(id));
    }
}
