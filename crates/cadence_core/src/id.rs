//! Identifiers for CADENCE entities.
//!
//! Engines, signals, timers and agents live in generational arenas owned by a
//! scheduler. Their ids carry a generation counter, so an id that outlived its
//! entity never resolves to a newer occupant of the same slot. Jobs are
//! numbered by submission order instead, because that order breaks ties
//! between equal priorities.

use serde::{Deserialize, Serialize};
use slotmap::{Key, new_key_type};

new_key_type! {
    /// Engine identifier - a schedulable unit in one scheduler
    pub struct EngineId;

    /// Signal identifier - a change-notification channel in one scheduler
    pub struct SignalId;

    /// Timer identifier - a timer served by one scheduler
    pub struct TimerId;

    /// Agent identifier - a participant of one resource arbiter
    pub struct AgentId;
}

macro_rules! arena_display {
    ($ty:ident, $prefix:literal) => {
        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let raw = self.data().as_ffi();
                // low half is the slot index, high half the generation
                write!(f, concat!($prefix, "_{}v{}"), raw & 0xffff_ffff, raw >> 32)
            }
        }
    };
}

arena_display!(EngineId, "engine");
arena_display!(SignalId, "signal");
arena_display!(TimerId, "timer");
arena_display!(AgentId, "agent");

/// Job identifier - sequence number assigned at submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(u64);

impl JobId {
    /// Create from raw sequence number
    #[must_use]
    pub const fn from_raw(seq: u64) -> Self {
        Self(seq)
    }

    /// Get the submission sequence number
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// The id following this one
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job_{}", self.0)
    }
}
