//! Error types for the worker pool.
//!
//! Three families of failure exist in this crate:
//!
//! - [`Error`]: lifecycle misuse and configuration problems reported by the
//!   [`Pool`] and [`Dispatcher`] APIs.
//! - [`JobError`]: a single job failed inside its handler. These never stop
//!   a worker; they are logged and, when enabled, forwarded on the pool's
//!   error channel.
//! - [`SubmitError`]: a producer tried to enqueue onto a closed (or, for
//!   [`JobQueue::try_send`], full) queue. The rejected [`Job`] is handed
//!   back.
//!
//! Resize requests that would break a floor are not errors at all: they are
//! silently rejected and the caller observes the unchanged size.
//!
//! [`Pool`]: crate::Pool
//! [`Dispatcher`]: crate::Dispatcher
//! [`JobQueue::try_send`]: crate::JobQueue::try_send
//! [`Job`]: crate::Job

use crate::job::Job;
use core::fmt;

/// Boxed error returned by job handlers.
pub type BoxError = Box<dyn core::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Lifecycle and configuration errors.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The supplied [`Config`](crate::Config) cannot produce a working pool.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// [`Pool::start`](crate::Pool::start) was called more than once.
    #[error("Pool has already been started")]
    AlreadyStarted,

    /// [`Dispatcher::run`](crate::Dispatcher::run) was called more than once.
    #[error("Dispatcher {id} is already running")]
    AlreadyRunning { id: usize },
}

/// A job that failed inside its handler.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum JobError {
    /// The handler returned an error.
    #[error("dispatcher {dispatcher} worker {worker} failed to handle job: {source}")]
    Failed {
        dispatcher: usize,
        worker: usize,
        #[source]
        source: BoxError,
    },

    /// The handler panicked. The panic was contained at the worker.
    #[error("dispatcher {dispatcher} worker {worker} panicked while handling job: {message}")]
    Panicked {
        dispatcher: usize,
        worker: usize,
        message: String,
    },
}

impl JobError {
    /// Id of the dispatcher whose worker ran the failed job.
    pub const fn dispatcher(&self) -> usize {
        match self {
            Self::Failed { dispatcher, .. } | Self::Panicked { dispatcher, .. } => *dispatcher,
        }
    }

    /// Id of the worker (unique within its dispatcher) that ran the job.
    pub const fn worker(&self) -> usize {
        match self {
            Self::Failed { worker, .. } | Self::Panicked { worker, .. } => *worker,
        }
    }
}

/// Why a job could not be enqueued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitErrorKind {
    /// The queue has been closed by the pool's done signal.
    Closed,
    /// The queue is at capacity (only from non-blocking sends).
    Full,
}

/// A job rejected by the queue, returned to the producer.
pub struct SubmitError<T> {
    kind: SubmitErrorKind,
    job: Job<T>,
}

impl<T> SubmitError<T> {
    pub(crate) const fn new(kind: SubmitErrorKind, job: Job<T>) -> Self {
        Self { kind, job }
    }

    pub const fn kind(&self) -> SubmitErrorKind {
        self.kind
    }

    pub const fn is_closed(&self) -> bool {
        matches!(self.kind, SubmitErrorKind::Closed)
    }

    /// Recovers the job that could not be enqueued.
    pub fn into_job(self) -> Job<T> {
        self.job
    }
}

// Implemented by hand so that payloads do not need to be `Debug`.
impl<T> fmt::Debug for SubmitError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmitError")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for SubmitError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SubmitErrorKind::Closed => write!(f, "job queue is closed"),
            SubmitErrorKind::Full => write!(f, "job queue is full"),
        }
    }
}

impl<T> core::error::Error for SubmitError<T> {}
