//! Exclusive access to a named resource, granted by priority.
//!
//! Agents register with a [`ResourceArbiter`], request access, and are
//! notified through their grant signal when access is granted. At most one
//! agent holds access at a time. The arbiter decides in its own engine at
//! [`Priority::LOW`], so everything that wants access in a pass has asked
//! before the decision is made. Among waiting agents the smallest priority
//! key wins; ties go to the earliest request.
//!
//! The arbiter engine refers back to the arbiter state through a
//! [`WeakHandle`]; once the arbiter is dropped the engine reads it as empty
//! and goes to sleep.

use std::cell::RefCell;
use std::rc::Rc;

use cadence_core::{AgentId, EngineId, Priority, SignalId, WeakHandle, WeakRegistry};
use slotmap::SlotMap;
use tracing::{debug, trace};

use crate::engine::{CycleContext, Engine};
use crate::scheduler::{SchedResult, Scheduler, SchedulerError};

#[derive(Debug)]
struct Agent {
    priority: Priority,
    /// Request sequence while waiting
    waiting: Option<u64>,
    grant: SignalId,
}

#[derive(Debug, Default)]
struct ArbiterState {
    agents: SlotMap<AgentId, Agent>,
    active: Option<AgentId>,
    next_request: u64,
}

impl ArbiterState {
    fn agent(&self, agent: AgentId) -> SchedResult<&Agent> {
        self.agents
            .get(agent)
            .ok_or(SchedulerError::AgentNotFound { agent })
    }

    fn agent_mut(&mut self, agent: AgentId) -> SchedResult<&mut Agent> {
        self.agents
            .get_mut(agent)
            .ok_or(SchedulerError::AgentNotFound { agent })
    }

    /// Pick the next holder if the resource is free.
    fn grant_next(&mut self) -> Option<(AgentId, SignalId)> {
        if self.active.is_some() {
            return None;
        }
        let (id, _) = self
            .agents
            .iter()
            .filter_map(|(id, agent)| agent.waiting.map(|seq| (id, (agent.priority, seq))))
            .min_by_key(|&(_, key)| key)?;

        let agent = self.agents.get_mut(id)?;
        agent.waiting = None;
        self.active = Some(id);
        Some((id, agent.grant))
    }
}

type SharedState = Rc<RefCell<ArbiterState>>;

struct ArbiterEngine {
    state: WeakHandle<SharedState>,
    name: String,
}

impl Engine for ArbiterEngine {
    fn cycle(&mut self, ctx: &mut CycleContext<'_>) -> bool {
        let Some(state) = self.state.get() else {
            debug!(resource = %self.name, engine = %ctx.engine_id(), "arbiter dropped without detach, engine idle");
            return false;
        };
        let granted = state.borrow_mut().grant_next();
        if let Some((agent, grant)) = granted {
            debug!(resource = %self.name, %agent, "access granted");
            // Grant signals live as long as their agents.
            let _ = ctx.fire(grant);
        }
        false
    }

    fn name(&self) -> &str {
        "resource-arbiter"
    }
}

/// Priority arbiter for one exclusive resource
///
/// The arbiter engine and the grant signals live in the scheduler, not in
/// this value. Call [`ResourceArbiter::detach`] to remove them; dropping the
/// arbiter only empties the engine's back-reference, and the engine and
/// signals stay registered until the scheduler itself goes away.
pub struct ResourceArbiter {
    resource: String,
    engine: EngineId,
    state: SharedState,
    registry: WeakRegistry<SharedState>,
}

impl ResourceArbiter {
    /// Create an arbiter for `resource` (for example `"cpu"`).
    pub fn new(scheduler: &mut Scheduler, resource: impl Into<String>) -> Self {
        let resource = resource.into();
        let state: SharedState = Rc::default();
        let registry = WeakRegistry::new(Rc::clone(&state));
        let engine = scheduler.add_idle_engine(
            Priority::LOW,
            ArbiterEngine {
                state: registry.handle(),
                name: resource.clone(),
            },
        );
        debug!(%resource, %engine, "arbiter created");
        Self {
            resource,
            engine,
            state,
            registry,
        }
    }

    /// Name of the arbitrated resource
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Engine that makes the grant decisions
    #[must_use]
    pub fn engine(&self) -> EngineId {
        self.engine
    }

    /// Register an agent with an access priority.
    pub fn register_agent(&mut self, scheduler: &mut Scheduler, priority: Priority) -> AgentId {
        let grant = scheduler.create_signal();
        self.state.borrow_mut().agents.insert(Agent {
            priority,
            waiting: None,
            grant,
        })
    }

    /// Release everything `agent` holds and remove it with its grant signal.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AgentNotFound`] for a stale id.
    pub fn remove_agent(&mut self, scheduler: &mut Scheduler, agent: AgentId) -> SchedResult<()> {
        self.release_access(scheduler, agent)?;
        let removed = self.state.borrow_mut().agents.remove(agent);
        match removed {
            Some(entry) => scheduler.remove_signal(entry.grant),
            None => Err(SchedulerError::AgentNotFound { agent }),
        }
    }

    /// Start waiting for access. Requesting while holding access gives it
    /// up and queues the agent again.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AgentNotFound`] for a stale id.
    pub fn request_access(&mut self, scheduler: &mut Scheduler, agent: AgentId) -> SchedResult<()> {
        let wake = {
            let mut state = self.state.borrow_mut();
            let seq = state.next_request;
            let entry = state.agent_mut(agent)?;
            if entry.waiting.is_none() {
                entry.waiting = Some(seq);
                state.next_request += 1;
            }
            if state.active == Some(agent) {
                state.active = None;
            }
            state.active.is_none()
        };
        trace!(resource = %self.resource, %agent, "access requested");
        if wake {
            scheduler.wake_up(self.engine)?;
        }
        Ok(())
    }

    /// Give up access, or stop waiting for it.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AgentNotFound`] for a stale id.
    pub fn release_access(&mut self, scheduler: &mut Scheduler, agent: AgentId) -> SchedResult<()> {
        let wake = {
            let mut state = self.state.borrow_mut();
            state.agent_mut(agent)?.waiting = None;
            if state.active == Some(agent) {
                state.active = None;
                true
            } else {
                false
            }
        };
        if wake {
            trace!(resource = %self.resource, %agent, "access released");
            scheduler.wake_up(self.engine)?;
        }
        Ok(())
    }

    /// Change the access priority of `agent`; takes effect at the next
    /// grant decision.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AgentNotFound`] for a stale id.
    pub fn set_access_priority(&mut self, agent: AgentId, priority: Priority) -> SchedResult<()> {
        self.state.borrow_mut().agent_mut(agent)?.priority = priority;
        Ok(())
    }

    /// Whether `agent` holds access
    #[must_use]
    pub fn has_access(&self, agent: AgentId) -> bool {
        self.state.borrow().active == Some(agent)
    }

    /// Whether `agent` is waiting for access
    #[must_use]
    pub fn is_waiting_for_access(&self, agent: AgentId) -> bool {
        self.state
            .borrow()
            .agents
            .get(agent)
            .is_some_and(|entry| entry.waiting.is_some())
    }

    /// Signal fired when `agent` is granted access.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AgentNotFound`] for a stale id.
    pub fn grant_signal(&self, agent: AgentId) -> SchedResult<SignalId> {
        self.state.borrow().agent(agent).map(|entry| entry.grant)
    }

    /// Current holder
    #[must_use]
    pub fn holder(&self) -> Option<AgentId> {
        self.state.borrow().active
    }

    /// Remove the arbiter engine and every grant signal from `scheduler`.
    ///
    /// This is the only way to release them before the scheduler is dropped.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the engine or a signal was already
    /// removed behind the arbiter's back.
    pub fn detach(self, scheduler: &mut Scheduler) -> SchedResult<()> {
        self.registry.break_handles();
        scheduler.remove_engine(self.engine)?;
        let grants: Vec<SignalId> = self
            .state
            .borrow()
            .agents
            .values()
            .map(|agent| agent.grant)
            .collect();
        for grant in grants {
            scheduler.remove_signal(grant)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ResourceArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("ResourceArbiter")
            .field("resource", &self.resource)
            .field("engine", &self.engine)
            .field("agents", &state.agents.len())
            .field("active", &state.active)
            .finish()
    }
}
