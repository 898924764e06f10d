//! Jobs: state, results and the handle returned by `submit`.
//!
//! ## Lifecycle
//! ```text
//! Queued ──dispatch──► Running ──Ok──────────► Done
//!   │                    ├──Err / panic─────► Failed
//!   │                    └──Err(Cancelled)──► Cancelled
//!   └──cancel──────────────────────────────► Cancelled
//! ```
//! Cancelling a running job only raises its [`CancellationToken`]; the body
//! decides when to stop.

use std::sync::{Arc, Weak};
use std::time::Duration;

use cadence_core::{JobId, JobPriority, SignalId};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::queue::{QueueError, Shared};

/// State of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum JobState {
    /// Waiting for a worker slot
    Queued,
    /// Executing on a worker
    Running,
    /// Finished with a value
    Done,
    /// Finished with an error or a panic
    Failed,
    /// Cancelled before or during execution
    Cancelled,
}

impl JobState {
    /// Whether the job will not change state again
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// Why a job did not produce a value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The job body reported a failure
    #[error("job failed: {0}")]
    Failed(String),
    /// The job was cancelled
    #[error("job cancelled")]
    Cancelled,
    /// The job body panicked
    #[error("job panicked: {0}")]
    Panicked(String),
}

impl JobError {
    /// Build a [`JobError::Failed`] from anything printable
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Self::Failed(reason.to_string())
    }

    /// Short stable label for logs
    #[must_use]
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Failed(_) => "job_failed",
            Self::Cancelled => "job_cancelled",
            Self::Panicked(_) => "job_panicked",
        }
    }
}

/// What a running job body can see
#[derive(Debug, Clone)]
pub struct JobContext {
    id: JobId,
    token: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(id: JobId, token: CancellationToken) -> Self {
        Self { id, token }
    }

    /// Id of the running job
    #[must_use]
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Whether cancellation was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `Err(JobError::Cancelled)` once cancellation was requested, for `?`
    /// at convenient checkpoints.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Cancelled`] after a cancel request.
    pub fn checkpoint(&self) -> Result<(), JobError> {
        if self.token.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// The underlying token, for handing to nested work
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Completion notice collected by the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobEvent {
    /// The job
    pub id: JobId,
    /// Its terminal state
    pub state: JobState,
}

#[derive(Debug)]
struct RecordInner<T> {
    state: JobState,
    priority: JobPriority,
    result: Option<Result<T, JobError>>,
}

/// Shared between the queue, the worker and every [`JobRef`].
#[derive(Debug)]
pub(crate) struct JobRecord<T> {
    pub(crate) id: JobId,
    pub(crate) token: CancellationToken,
    pub(crate) signal: Option<SignalId>,
    inner: Mutex<RecordInner<T>>,
    changed: Condvar,
}

impl<T> JobRecord<T> {
    pub(crate) fn new(id: JobId, priority: JobPriority, signal: Option<SignalId>) -> Self {
        Self {
            id,
            token: CancellationToken::new(),
            signal,
            inner: Mutex::new(RecordInner {
                state: JobState::Queued,
                priority,
                result: None,
            }),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn state(&self) -> JobState {
        self.inner.lock().state
    }

    pub(crate) fn priority(&self) -> JobPriority {
        self.inner.lock().priority
    }

    pub(crate) fn set_priority(&self, priority: JobPriority) {
        self.inner.lock().priority = priority;
    }

    pub(crate) fn mark_running(&self) {
        self.inner.lock().state = JobState::Running;
        self.changed.notify_all();
    }

    /// Store the outcome; returns the terminal state.
    pub(crate) fn finish(&self, result: Result<T, JobError>) -> JobState {
        let state = match &result {
            Ok(_) => JobState::Done,
            Err(JobError::Cancelled) => JobState::Cancelled,
            Err(_) => JobState::Failed,
        };
        let mut inner = self.inner.lock();
        inner.state = state;
        inner.result = Some(result);
        drop(inner);
        self.changed.notify_all();
        state
    }
}

/// Handle to a submitted job.
///
/// Cloning is cheap; every clone observes the same job. The handle stays
/// valid after the queue is gone, but priority changes and cancellation then
/// report [`QueueError::ShutDown`].
pub struct JobRef<T> {
    record: Arc<JobRecord<T>>,
    queue: Weak<Shared<T>>,
}

impl<T> Clone for JobRef<T> {
    fn clone(&self) -> Self {
        Self {
            record: Arc::clone(&self.record),
            queue: Weak::clone(&self.queue),
        }
    }
}

impl<T: Send + 'static> JobRef<T> {
    pub(crate) fn new(record: Arc<JobRecord<T>>, queue: Weak<Shared<T>>) -> Self {
        Self { record, queue }
    }

    pub(crate) fn belongs_to(&self, shared: &Arc<Shared<T>>) -> bool {
        std::ptr::eq(self.queue.as_ptr(), Arc::as_ptr(shared))
    }

    /// Job id
    #[must_use]
    pub fn id(&self) -> JobId {
        self.record.id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> JobState {
        self.record.state()
    }

    /// Whether the job reached a terminal state
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.record.state().is_terminal()
    }

    /// Submitted (or last set) priority weight
    #[must_use]
    pub fn priority(&self) -> JobPriority {
        self.record.priority()
    }

    /// Signal fired on this job's state changes, if it has one
    #[must_use]
    pub fn state_signal(&self) -> Option<SignalId> {
        self.record.signal
    }

    /// Change the priority. A queued job is re-sorted; for a running or
    /// finished job only the stored weight changes.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ShutDown`] once the queue is dropped.
    pub fn set_priority(&self, priority: JobPriority) -> Result<(), QueueError> {
        let shared = self.queue.upgrade().ok_or(QueueError::ShutDown)?;
        shared.reprioritize(&self.record, priority);
        Ok(())
    }

    /// Cancel the job: a queued job becomes `Cancelled` at once, a running
    /// job has its token raised. Returns the state after the request.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ShutDown`] once the queue is dropped.
    pub fn cancel(&self) -> Result<JobState, QueueError> {
        let shared = self.queue.upgrade().ok_or(QueueError::ShutDown)?;
        Ok(shared.cancel(&self.record))
    }

    /// Block until the job is finished.
    pub fn wait(&self) -> JobState {
        let mut inner = self.record.inner.lock();
        while !inner.state.is_terminal() {
            self.record.changed.wait(&mut inner);
        }
        inner.state
    }

    /// Block until the job is finished or `timeout` elapsed; `None` on
    /// timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<JobState> {
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = self.record.inner.lock();
        while !inner.state.is_terminal() {
            if self
                .record
                .changed
                .wait_until(&mut inner, deadline)
                .timed_out()
            {
                return inner.state.is_terminal().then_some(inner.state);
            }
        }
        Some(inner.state)
    }

    /// Move the result out. `None` until the job is finished, and after the
    /// result was taken.
    pub fn take_result(&self) -> Option<Result<T, JobError>> {
        self.record.inner.lock().result.take()
    }

    /// Error of a failed or cancelled job, without taking it
    #[must_use]
    pub fn error(&self) -> Option<JobError> {
        match &self.record.inner.lock().result {
            Some(Err(err)) => Some(err.clone()),
            _ => None,
        }
    }
}

impl<T> std::fmt::Debug for JobRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRef")
            .field("id", &self.record.id)
            .field("state", &self.record.state())
            .finish()
    }
}
