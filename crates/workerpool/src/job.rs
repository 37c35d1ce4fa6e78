//! Jobs, the shared job queue and the handler contract.

use crate::error::{BoxError, SubmitError, SubmitErrorKind};
use async_channel::{Receiver, Sender, TrySendError};
use core::future::Future;

/// A unit of work. The pool never inspects the payload.
///
/// Heterogeneous workloads can use `Job<Box<dyn Any + Send>>` and narrow the
/// payload inside the handler; a failed narrowing is reported like any other
/// handler error.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct Job<T> {
    data: T,
}

impl<T> Job<T> {
    pub const fn new(data: T) -> Self {
        Self { data }
    }

    pub const fn data(&self) -> &T {
        &self.data
    }

    pub fn into_inner(self) -> T {
        self.data
    }
}

impl<T> From<T> for Job<T> {
    fn from(data: T) -> Self {
        Self::new(data)
    }
}

/// Receiving side of a job queue, read competitively by every dispatcher.
pub type JobReceiver<T> = Receiver<Job<T>>;

/// Producer handle for a bounded job queue.
///
/// The queue's capacity is its only backpressure: [`send`](Self::send)
/// suspends while it is full. Handles are cheap to clone and can be moved
/// into any number of producer tasks or threads. A producer can never close
/// a pool's queue; the [`Pool`](crate::Pool) closes it when its done signal
/// fires.
pub struct JobQueue<T> {
    tx: Sender<Job<T>>,
}

impl<T> Clone for JobQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> core::fmt::Debug for JobQueue<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobQueue")
            .field("len", &self.tx.len())
            .field("capacity", &self.tx.capacity())
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<T> JobQueue<T> {
    /// Creates a bounded queue and returns both ends, for driving a
    /// [`Dispatcher`](crate::Dispatcher) without a pool. The queue closes once
    /// every producer handle has been dropped.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn bounded(capacity: usize) -> (Self, JobReceiver<T>) {
        let (tx, rx) = async_channel::bounded(capacity);
        (Self { tx }, rx)
    }

    /// Enqueues a job, waiting for room if the queue is full.
    ///
    /// # Errors
    ///
    /// Returns the job if the queue has been closed.
    pub async fn send(&self, job: impl Into<Job<T>>) -> Result<(), SubmitError<T>> {
        self.tx
            .send(job.into())
            .await
            .map_err(|e| SubmitError::new(SubmitErrorKind::Closed, e.into_inner()))
    }

    /// Blocking variant of [`send`](Self::send) for producers running on
    /// plain threads. Must not be called from within an async context.
    ///
    /// # Errors
    ///
    /// Returns the job if the queue has been closed.
    pub fn send_blocking(&self, job: impl Into<Job<T>>) -> Result<(), SubmitError<T>> {
        self.tx
            .send_blocking(job.into())
            .map_err(|e| SubmitError::new(SubmitErrorKind::Closed, e.into_inner()))
    }

    /// Enqueues a job only if there is room right now.
    ///
    /// # Errors
    ///
    /// Returns the job if the queue is full or closed.
    pub fn try_send(&self, job: impl Into<Job<T>>) -> Result<(), SubmitError<T>> {
        self.tx.try_send(job.into()).map_err(|e| match e {
            TrySendError::Full(job) => SubmitError::new(SubmitErrorKind::Full, job),
            TrySendError::Closed(job) => SubmitError::new(SubmitErrorKind::Closed, job),
        })
    }

    /// Number of jobs waiting to be claimed by a dispatcher.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.tx.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Stops admitting jobs. Jobs already queued remain readable.
    pub(crate) fn close(&self) -> bool {
        self.tx.close()
    }
}

/// Caller logic that executes a [`Job`].
///
/// A handler is created once per dispatcher by a [`HandlerFactory`] and
/// shared by that dispatcher's workers, so `handle` takes `&self`; state
/// that must be mutated needs its own synchronization. The returned error is
/// reported but never stops the worker, and the pool does not retry.
///
/// Any `Fn(Job<T>) -> impl Future<Output = Result<(), BoxError>>` closure is
/// a handler.
pub trait JobHandler<T>: Send + Sync + 'static {
    fn handle(&self, job: Job<T>) -> impl Future<Output = Result<(), BoxError>> + Send;
}

impl<T, F, Fut> JobHandler<T> for F
where
    F: Fn(Job<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    fn handle(&self, job: Job<T>) -> impl Future<Output = Result<(), BoxError>> + Send {
        self(job)
    }
}

/// Produces one [`JobHandler`] per dispatcher.
///
/// Handler-local state is therefore per-dispatcher unless the factory hands
/// out clones of something shared.
///
/// [`create`](Self::create) runs on the caller of
/// [`Pool::start`](crate::Pool::start) or
/// [`Pool::add_dispatch`](crate::Pool::add_dispatch) without any pool lock
/// held, so it may read the pool's size or worker count.
pub trait HandlerFactory<T>: Send + Sync + 'static {
    type Handler: JobHandler<T>;

    fn create(&self) -> Self::Handler;
}

impl<T, F, H> HandlerFactory<T> for F
where
    F: Fn() -> H + Send + Sync + 'static,
    H: JobHandler<T>,
{
    type Handler = H;

    fn create(&self) -> H {
        self()
    }
}
