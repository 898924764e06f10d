//! Priority job queue on a bounded pool of worker threads.
//!
//! - Pending jobs sit in a `BTreeMap` keyed by `(effective priority, id)`:
//!   smaller weights first, submission order among equals.
//! - Effective priorities are refreshed from the [`AgingPolicy`] right before
//!   each dispatch. Only jobs whose next promotion point has passed are
//!   re-keyed.
//! - Pending list, running set and event log share one mutex; each job's
//!   record has its own. Lock order is always queue, then record.
//! - The event log keeps at most [`JobQueueConfig::event_limit`] notices and
//!   drops the oldest beyond that.
//! - Workers never touch the engine graph. State changes reach the scheduler
//!   thread as remote signal fires.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use cadence_core::{CoreError, JobId, JobPriority, SignalId};
use cadence_runtime::{RemoteSignaler, Scheduler};
use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::aging::{AgingPolicy, Promotion};
use crate::config::{JobQueueConfig, NotificationMode};
use crate::job::{JobContext, JobError, JobEvent, JobRecord, JobRef, JobState};

/// Job queue error
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue is shutting down or gone
    #[error("job queue is shut down")]
    ShutDown,
    /// The job belongs to another queue
    #[error("unknown job: {id}")]
    UnknownJob {
        /// The job
        id: JobId,
    },
    /// Rejected configuration
    #[error("invalid job queue configuration: {0}")]
    InvalidConfig(#[from] CoreError),
    /// A worker thread could not be started
    #[error("failed to spawn job worker: {0}")]
    Spawn(#[from] std::io::Error),
}

type JobBody<T> = Box<dyn FnOnce(&JobContext) -> Result<T, JobError> + Send>;

struct PendingJob<T> {
    base: JobPriority,
    effective: JobPriority,
    enqueued_at: Instant,
    /// Dispatch counter at submission
    dispatch_mark: u64,
    /// Next aging step; `None` once the job cannot be promoted further
    promotion: Option<Promotion>,
    body: JobBody<T>,
    record: Arc<JobRecord<T>>,
}

impl<T> PendingJob<T> {
    fn new(priority: JobPriority, dispatch_mark: u64, body: JobBody<T>, record: Arc<JobRecord<T>>) -> Self {
        Self {
            base: priority,
            effective: priority,
            enqueued_at: Instant::now(),
            dispatch_mark,
            promotion: None,
            body,
            record,
        }
    }

    fn key(&self) -> (JobPriority, JobId) {
        (self.effective, self.record.id)
    }

    /// Recompute the effective priority and the next promotion point.
    fn refresh(&mut self, policy: &AgingPolicy, dispatches: u64, now: Instant) {
        self.effective = policy.effective(
            self.base,
            dispatches.saturating_sub(self.dispatch_mark),
            now.saturating_duration_since(self.enqueued_at),
        );
        self.promotion =
            policy.next_promotion(self.base, self.effective, self.dispatch_mark, self.enqueued_at);
    }
}

/// Everything guarded by the queue mutex.
struct QueueState<T> {
    pending: BTreeMap<(JobPriority, JobId), PendingJob<T>>,
    /// Job -> current effective priority, to find pending entries by id
    keys: IndexMap<JobId, JobPriority>,
    /// Pending jobs that can still age, by the point of their next step
    promotions: BTreeSet<(Promotion, JobId)>,
    running: IndexMap<JobId, Arc<JobRecord<T>>>,
    dispatches: u64,
    next_id: JobId,
    shutdown: bool,
    events: VecDeque<JobEvent>,
    /// Events were dropped since the last drain
    events_overflowed: bool,
    aging: AgingPolicy,
    event_limit: usize,
}

impl<T> QueueState<T> {
    fn new(config: &JobQueueConfig) -> Self {
        Self {
            pending: BTreeMap::new(),
            keys: IndexMap::new(),
            promotions: BTreeSet::new(),
            running: IndexMap::new(),
            dispatches: 0,
            next_id: JobId::from_raw(0),
            shutdown: false,
            events: VecDeque::new(),
            events_overflowed: false,
            aging: config.aging,
            event_limit: config.event_limit,
        }
    }

    fn allocate_id(&mut self) -> JobId {
        let id = self.next_id;
        self.next_id = id.next();
        id
    }

    fn insert(&mut self, job: PendingJob<T>) {
        let id = job.record.id;
        self.keys.insert(id, job.effective);
        if let Some(point) = job.promotion {
            self.promotions.insert((point, id));
        }
        self.pending.insert(job.key(), job);
    }

    fn remove(&mut self, id: JobId) -> Option<PendingJob<T>> {
        let effective = self.keys.swap_remove(&id)?;
        let job = self.pending.remove(&(effective, id))?;
        if let Some(point) = job.promotion {
            self.promotions.remove(&(point, id));
        }
        Some(job)
    }

    /// Queue a new job at its submitted priority.
    fn submit(&mut self, mut job: PendingJob<T>) {
        job.refresh(&self.aging, self.dispatches, job.enqueued_at);
        self.insert(job);
    }

    /// Give a pending job a new base priority. `false` if it is not pending.
    fn reprioritize(&mut self, id: JobId, priority: JobPriority, now: Instant) -> bool {
        let Some(mut job) = self.remove(id) else {
            return false;
        };
        job.base = priority;
        job.refresh(&self.aging, self.dispatches, now);
        self.insert(job);
        true
    }

    /// Re-key pending jobs whose promotion point has passed.
    fn age(&mut self, now: Instant) {
        let dispatches = self.dispatches;
        while let Some(&(point, id)) = self.promotions.first() {
            if !point.is_due(dispatches, now) {
                break;
            }
            let Some(mut job) = self.remove(id) else {
                self.promotions.remove(&(point, id));
                continue;
            };
            let from = job.effective;
            job.refresh(&self.aging, dispatches, now);
            trace!(job = %id, %from, to = %job.effective, "job promoted");
            self.insert(job);
        }
    }

    fn pop_next(&mut self, now: Instant) -> Option<PendingJob<T>> {
        self.age(now);
        let (_, job) = self.pending.pop_first()?;
        self.keys.swap_remove(&job.record.id);
        if let Some(point) = job.promotion {
            self.promotions.remove(&(point, job.record.id));
        }
        self.dispatches += 1;
        Some(job)
    }

    /// Log a terminal-state notice, dropping the oldest past the limit.
    fn record(&mut self, event: JobEvent) {
        if self.event_limit == 0 {
            return;
        }
        if self.events.len() >= self.event_limit {
            self.events.pop_front();
            if !self.events_overflowed {
                self.events_overflowed = true;
                warn!(limit = self.event_limit, "job event log full, dropping oldest events");
            }
        }
        self.events.push_back(event);
    }

    fn drain_events(&mut self) -> Vec<JobEvent> {
        self.events_overflowed = false;
        self.events.drain(..).collect()
    }
}

/// State shared by the queue, its workers and job handles.
pub(crate) struct Shared<T> {
    state: Mutex<QueueState<T>>,
    work_ready: Condvar,
    config: JobQueueConfig,
    notifier: Option<RemoteSignaler>,
    queue_signal: Option<SignalId>,
}

impl<T: Send + 'static> Shared<T> {
    pub(crate) fn reprioritize(&self, record: &Arc<JobRecord<T>>, priority: JobPriority) {
        let mut state = self.state.lock();
        record.set_priority(priority);
        if state.reprioritize(record.id, priority, Instant::now()) {
            trace!(job = %record.id, %priority, "queued job re-sorted");
        }
    }

    pub(crate) fn cancel(&self, record: &Arc<JobRecord<T>>) -> JobState {
        let mut state = self.state.lock();
        if let Some(job) = state.remove(record.id) {
            let terminal = record.finish(Err(JobError::Cancelled));
            state.record(JobEvent {
                id: record.id,
                state: terminal,
            });
            drop(state);
            drop(job);
            debug!(job = %record.id, "queued job cancelled");
            self.notify(record);
            return terminal;
        }
        drop(state);

        record.token.cancel();
        let current = record.state();
        if current == JobState::Running {
            debug!(job = %record.id, "cancellation requested for running job");
        }
        current
    }

    /// Cancel every pending job and raise every running job's token.
    /// Returns the number of pending jobs cancelled.
    fn cancel_all(&self) -> usize {
        let mut state = self.state.lock();
        let drained: Vec<PendingJob<T>> = std::mem::take(&mut state.pending).into_values().collect();
        state.keys.clear();
        state.promotions.clear();
        for job in &drained {
            let terminal = job.record.finish(Err(JobError::Cancelled));
            state.record(JobEvent {
                id: job.record.id,
                state: terminal,
            });
        }
        for record in state.running.values() {
            record.token.cancel();
        }
        drop(state);

        for job in &drained {
            self.notify(&job.record);
        }
        drained.len()
    }

    /// Block until a job is available; `None` once shut down.
    fn next_job(&self) -> Option<PendingJob<T>> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(job) = state.pop_next(Instant::now()) {
                job.record.mark_running();
                state.running.insert(job.record.id, Arc::clone(&job.record));
                return Some(job);
            }
            self.work_ready.wait(&mut state);
        }
    }

    fn complete(&self, record: &Arc<JobRecord<T>>, result: Result<T, JobError>) {
        let mut state = self.state.lock();
        let err = result.as_ref().err().cloned();
        let terminal = record.finish(result);
        state.running.shift_remove(&record.id);
        state.record(JobEvent {
            id: record.id,
            state: terminal,
        });
        drop(state);

        match err {
            Some(JobError::Cancelled) | None => trace!(job = %record.id, ?terminal, "job finished"),
            Some(err) => warn!(job = %record.id, error = %err, label = err.as_label(), "job failed"),
        }
        self.notify(record);
    }

    fn notify(&self, record: &JobRecord<T>) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let signal = match self.config.notification {
            NotificationMode::None => None,
            NotificationMode::PerQueue => self.queue_signal,
            NotificationMode::PerJob => record.signal,
        };
        if let Some(signal) = signal {
            notifier.fire(signal);
        }
    }
}

fn run_worker<T: Send + 'static>(shared: Arc<Shared<T>>, slot: usize) {
    debug!(slot, "job worker started");
    while let Some(job) = shared.next_job() {
        let PendingJob { body, record, .. } = job;
        shared.notify(&record);

        let ctx = JobContext::new(record.id, record.token.clone());
        trace!(job = %record.id, slot, "job running");
        let result = match panic::catch_unwind(AssertUnwindSafe(|| body(&ctx))) {
            Ok(result) => result,
            Err(payload) => Err(JobError::Panicked(panic_message(payload.as_ref()))),
        };
        shared.complete(&record, result);
    }
    debug!(slot, "job worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Priority-weighted background job queue
///
/// Dropping the queue cancels pending jobs, raises the cancellation token of
/// running jobs and joins the workers.
pub struct JobQueue<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> JobQueue<T> {
    /// Start a queue that fires no signals.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidConfig`] or [`QueueError::Spawn`].
    pub fn new(config: JobQueueConfig) -> Result<Self, QueueError> {
        Self::start(config, None, None)
    }

    /// Start a queue that reports state changes to `scheduler` as
    /// configured by [`JobQueueConfig::notification`].
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidConfig`] or [`QueueError::Spawn`].
    pub fn attached(config: JobQueueConfig, scheduler: &mut Scheduler) -> Result<Self, QueueError> {
        let queue_signal = (config.notification == NotificationMode::PerQueue)
            .then(|| scheduler.create_signal());
        Self::start(config, Some(scheduler.remote_signaler()), queue_signal)
    }

    fn start(
        config: JobQueueConfig,
        notifier: Option<RemoteSignaler>,
        queue_signal: Option<SignalId>,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        let slots = config.worker_slots;
        let prefix = config.thread_name_prefix.clone();
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::new(&config)),
            work_ready: Condvar::new(),
            config,
            notifier,
            queue_signal,
        });

        // On a spawn error the partially built queue is dropped, which stops
        // the workers already running.
        let mut queue = Self {
            shared,
            workers: Vec::with_capacity(slots),
        };
        for slot in 0..slots {
            let shared = Arc::clone(&queue.shared);
            let handle = thread::Builder::new()
                .name(format!("{prefix}-{slot}"))
                .spawn(move || run_worker(shared, slot))?;
            queue.workers.push(handle);
        }
        debug!(slots, "job queue started");
        Ok(queue)
    }

    /// Queue configuration
    #[must_use]
    pub fn config(&self) -> &JobQueueConfig {
        &self.shared.config
    }

    /// Signal fired on state changes in [`NotificationMode::PerQueue`]
    #[must_use]
    pub fn queue_signal(&self) -> Option<SignalId> {
        self.shared.queue_signal
    }

    /// Submit a job. It starts as soon as a worker slot is free and no
    /// more urgent job is pending.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ShutDown`] while the queue is stopping.
    pub fn submit<F>(&self, priority: JobPriority, body: F) -> Result<JobRef<T>, QueueError>
    where
        F: FnOnce(&JobContext) -> Result<T, JobError> + Send + 'static,
    {
        self.enqueue(priority, None, Box::new(body))
    }

    /// Submit a job whose state changes fire `signal` in
    /// [`NotificationMode::PerJob`].
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ShutDown`] while the queue is stopping.
    pub fn submit_signaled<F>(
        &self,
        priority: JobPriority,
        signal: SignalId,
        body: F,
    ) -> Result<JobRef<T>, QueueError>
    where
        F: FnOnce(&JobContext) -> Result<T, JobError> + Send + 'static,
    {
        self.enqueue(priority, Some(signal), Box::new(body))
    }

    fn enqueue(
        &self,
        priority: JobPriority,
        signal: Option<SignalId>,
        body: JobBody<T>,
    ) -> Result<JobRef<T>, QueueError> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(QueueError::ShutDown);
        }
        let id = state.allocate_id();
        let record = Arc::new(JobRecord::new(id, priority, signal));
        let dispatch_mark = state.dispatches;
        state.submit(PendingJob::new(priority, dispatch_mark, body, Arc::clone(&record)));
        drop(state);

        self.shared.work_ready.notify_one();
        trace!(job = %id, %priority, "job submitted");
        Ok(JobRef::new(record, Arc::downgrade(&self.shared)))
    }

    /// Cancel `job`; see [`JobRef::cancel`].
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::UnknownJob`] for a job of another queue.
    pub fn cancel(&self, job: &JobRef<T>) -> Result<JobState, QueueError> {
        if !job.belongs_to(&self.shared) {
            return Err(QueueError::UnknownJob { id: job.id() });
        }
        job.cancel()
    }

    /// Cancel every pending job and request cancellation of every running
    /// job. Returns the number of pending jobs cancelled.
    pub fn cancel_all(&self) -> usize {
        let cancelled = self.shared.cancel_all();
        debug!(cancelled, "all jobs cancelled");
        cancelled
    }

    /// Take the terminal-state notices collected since the last call.
    ///
    /// At most [`JobQueueConfig::event_limit`] are kept between calls; older
    /// notices are dropped first.
    pub fn drain_events(&self) -> Vec<JobEvent> {
        self.shared.state.lock().drain_events()
    }

    /// Jobs waiting for a slot
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Jobs currently running
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.shared.state.lock().running.len()
    }

    /// Whether no job is pending or running
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = self.shared.state.lock();
        state.pending.is_empty() && state.running.is_empty()
    }

    /// Number of worker slots
    #[must_use]
    pub fn worker_slots(&self) -> usize {
        self.workers.len()
    }
}

impl<T: Send + 'static> Drop for JobQueue<T> {
    fn drop(&mut self) {
        let cancelled = self.shared.cancel_all();
        self.shared.state.lock().shutdown = true;
        self.shared.work_ready.notify_all();

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("job worker exited by panic");
            }
        }
        debug!(cancelled, "job queue stopped");
    }
}

impl<T: Send + 'static> std::fmt::Debug for JobQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("JobQueue")
            .field("workers", &self.workers.len())
            .field("pending", &state.pending.len())
            .field("running", &state.running.len())
            .field("dispatches", &state.dispatches)
            .finish()
    }
}
