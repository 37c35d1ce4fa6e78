//! Top-level facade over a set of dispatchers sharing one job queue.
//!
//! Every dispatcher competes to read the same bounded queue, so whichever is
//! ready first claims the next job; there is no other scheduling policy.
//! The pool's lifetime is tied to an external done signal: cancelling it
//! closes the queue, waits for every dispatcher to drain, stops them, marks
//! the pool closed and finally closes the error channel.

use crate::{
    config::Config,
    dispatcher::Dispatcher,
    error::{Error, JobError, Result, SubmitError},
    job::{HandlerFactory, Job, JobQueue, JobReceiver},
    observer::{NoopObserver, PoolObserver},
};
use async_channel::{Receiver, Sender};
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

type PoolDispatcher<T, F> = Dispatcher<T, <F as HandlerFactory<T>>::Handler>;

struct State<T, F: HandlerFactory<T>> {
    size: usize,
    max_dispatchers: usize,
    next_id: usize,
    started: bool,
    running: bool,
    draining: bool,
    closed: bool,
    dispatchers: Vec<Arc<PoolDispatcher<T, F>>>,
}

impl<T: Send + 'static, F: HandlerFactory<T>> State<T, F> {
    fn can_grow(&self, n: usize) -> bool {
        self.running && !self.draining && !self.closed && self.size + n <= self.max_dispatchers
    }

    /// Forgets dispatchers that finished stopping. They already released
    /// their drain token, so the done listener never waits on them.
    fn prune_closed(&mut self) {
        self.dispatchers.retain(|d| !d.closed());
    }
}

struct Inner<T, F: HandlerFactory<T>> {
    config: Config,
    factory: F,
    queue: JobQueue<T>,
    receiver: JobReceiver<T>,
    errors: Option<(Sender<JobError>, Receiver<JobError>)>,
    done: CancellationToken,
    dispatcher_stop: CancellationToken,
    drain_barrier: TaskTracker,
    closed_token: CancellationToken,
    observer: Arc<dyn PoolObserver>,
    state: Mutex<State<T, F>>,
    #[cfg(feature = "tracing")]
    span: tracing::Span,
}

/// A pool of dispatchers, each owning a set of workers.
///
/// `Pool` is a cheap handle: clones share the same pool.
///
/// ```
/// use std::sync::{Arc, atomic::{AtomicU64, Ordering}};
/// use tokio_util::sync::CancellationToken;
/// use workerpool::{BoxError, Config, Job, Pool};
///
/// # #[tokio::main(flavor = "multi_thread", worker_threads = 2)]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let sum = Arc::new(AtomicU64::new(0));
/// let done = CancellationToken::new();
///
/// let factory = {
///     let sum = sum.clone();
///     move || {
///         let sum = sum.clone();
///         move |job: Job<u64>| {
///             let sum = sum.clone();
///             async move {
///                 sum.fetch_add(job.into_inner(), Ordering::Relaxed);
///                 Ok::<(), BoxError>(())
///             }
///         }
///     }
/// };
///
/// let pool: Pool<u64, _> =
///     Pool::new(done.clone(), factory, Config::default().with_init_dispatchers(2));
/// pool.start()?;
/// for i in 1..=10 {
///     pool.submit(i).await?;
/// }
///
/// done.cancel();
/// pool.wait_closed().await;
/// assert!(pool.closed());
/// assert_eq!(sum.load(Ordering::Relaxed), 55);
/// # Ok(())
/// # }
/// ```
pub struct Pool<T, F: HandlerFactory<T>> {
    inner: Arc<Inner<T, F>>,
}

impl<T, F: HandlerFactory<T>> Clone for Pool<T, F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Assembles a [`Pool`] with an optional metrics sink.
pub struct PoolBuilder<T, F> {
    done: CancellationToken,
    factory: F,
    config: Config,
    observer: Arc<dyn PoolObserver>,
    _payload: core::marker::PhantomData<fn() -> T>,
}

impl<T, F> PoolBuilder<T, F>
where
    T: Send + 'static,
    F: HandlerFactory<T>,
{
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Receives job and lifecycle callbacks from every dispatcher and worker.
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn PoolObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration is unusable.
    pub fn build(self) -> Result<Pool<T, F>> {
        let config = self.config.normalized()?;
        let (queue, receiver) = JobQueue::bounded(config.job_queue_capacity);
        let errors = config
            .errors_enabled
            .then(|| async_channel::bounded(config.error_buffer_size));

        #[cfg(feature = "tracing")]
        let span = tracing::info_span!("pool", name = %config.name);

        Ok(Pool {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    size: 0,
                    max_dispatchers: config.max_dispatchers,
                    next_id: 0,
                    started: false,
                    running: false,
                    draining: false,
                    closed: false,
                    dispatchers: Vec::with_capacity(config.init_dispatchers),
                }),
                config,
                factory: self.factory,
                queue,
                receiver,
                errors,
                done: self.done,
                dispatcher_stop: CancellationToken::new(),
                drain_barrier: TaskTracker::new(),
                closed_token: CancellationToken::new(),
                observer: self.observer,
                #[cfg(feature = "tracing")]
                span,
            }),
        })
    }
}

impl<T, F> Pool<T, F>
where
    T: Send + 'static,
    F: HandlerFactory<T>,
{
    /// Starts building a pool with the default [`Config`] and no observer.
    ///
    /// # Arguments
    ///
    /// - `done`: Cancelling this token closes the queue and starts the
    ///   drain. The pool never cancels it itself.
    /// - `factory`: Called once per dispatcher, at [`start`](Self::start)
    ///   and on every [`add_dispatch`](Self::add_dispatch), to create that
    ///   dispatcher's handler.
    ///
    /// # Example
    ///
    /// ```
    /// use tokio_util::sync::CancellationToken;
    /// use workerpool::{BoxError, Config, Job, Pool};
    ///
    /// let factory = || |job: Job<u32>| async move {
    ///     let _ = job.into_inner();
    ///     Ok::<(), BoxError>(())
    /// };
    /// let pool: Pool<u32, _> = Pool::builder(CancellationToken::new(), factory)
    ///     .config(Config::default().with_init_dispatchers(2))
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(pool.size(), 0);
    /// ```
    pub fn builder(done: CancellationToken, factory: F) -> PoolBuilder<T, F> {
        PoolBuilder {
            done,
            factory,
            config: Config::default(),
            observer: Arc::new(NoopObserver),
            _payload: core::marker::PhantomData,
        }
    }

    /// Creates a pool that shuts down once `done` is cancelled. `factory` is
    /// called once per dispatcher. Equivalent to
    /// [`builder`](Self::builder) followed by [`PoolBuilder::config`] and
    /// [`PoolBuilder::build`].
    ///
    /// # Arguments
    ///
    /// - `done`: Shutdown signal; see [`builder`](Self::builder).
    /// - `factory`: Creates one handler per dispatcher.
    /// - `config`: Dispatcher bounds, workers per dispatcher, queue capacity
    ///   and error reporting.
    ///
    /// # Panics
    ///
    /// A configuration without dispatchers, workers or queue capacity is a
    /// programming error and panics. Use [`Pool::try_new`] to handle it.
    pub fn new(done: CancellationToken, factory: F, config: Config) -> Self {
        match Self::try_new(done, factory, config) {
            Ok(pool) => pool,
            Err(e) => panic!("{e}"),
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration is unusable.
    pub fn try_new(done: CancellationToken, factory: F, config: Config) -> Result<Self> {
        Self::builder(done, factory).config(config).build()
    }

    /// Starts `init_dispatchers` dispatchers on the current Tokio runtime and
    /// begins listening for the done signal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] if called more than once.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        #[cfg(feature = "tracing")]
        let _entered = self.inner.span.enter();

        {
            let mut state = self.inner.state.lock();
            if state.started {
                return Err(Error::AlreadyStarted);
            }
            state.started = true;
        }

        let handlers = self.create_handlers(self.inner.config.init_dispatchers);
        let mut state = self.inner.state.lock();
        for handler in handlers {
            self.spawn_dispatcher(&mut state, handler)?;
            state.size += 1;
        }
        state.running = true;
        drop(state);

        let fut = listen(Arc::clone(&self.inner));
        #[cfg(feature = "tracing")]
        let fut = {
            use tracing::Instrument;
            fut.in_current_span()
        };
        tokio::spawn(fut);

        #[cfg(feature = "tracing")]
        tracing::info!(
            "Pool started with {} dispatchers of {} workers",
            self.inner.config.init_dispatchers,
            self.inner.config.workers
        );
        Ok(())
    }

    /// Runs the factory without holding the state lock, so a factory may
    /// query the pool.
    fn create_handlers(&self, n: usize) -> Vec<F::Handler> {
        (0..n).map(|_| self.inner.factory.create()).collect()
    }

    fn spawn_dispatcher(&self, state: &mut State<T, F>, handler: F::Handler) -> Result<()> {
        let inner = &self.inner;
        let id = state.next_id;
        state.next_id += 1;

        let mut dispatcher = Dispatcher::new(
            id,
            inner.config.workers,
            inner.receiver.clone(),
            handler,
        )
        .with_stop(inner.dispatcher_stop.child_token())
        .with_observer(Arc::clone(&inner.observer))
        .with_worker_floor(inner.config.worker_floor)
        .with_drain_token(inner.drain_barrier.token());
        if let Some((errors, _)) = &inner.errors {
            dispatcher = dispatcher.with_errors(errors.clone());
        }

        let dispatcher = Arc::new(dispatcher);
        dispatcher.run()?;
        state.dispatchers.push(dispatcher);
        Ok(())
    }

    /// Producer handle for the shared job queue.
    pub fn queue(&self) -> JobQueue<T> {
        self.inner.queue.clone()
    }

    /// Enqueues a job, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns the job once the done signal has closed the queue.
    pub async fn submit(&self, job: impl Into<Job<T>>) -> Result<(), SubmitError<T>> {
        self.inner.queue.send(job).await
    }

    /// Failed jobs, if `errors_enabled` was set. The channel closes after the
    /// pool does. Consumers must keep up: workers wait while it is full.
    pub fn errors(&self) -> Option<Receiver<JobError>> {
        self.inner.errors.as_ref().map(|(_, rx)| rx.clone())
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// True only after the done signal fired and every job handed to the
    /// pool has finished.
    pub fn closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Waits until [`closed`](Self::closed) is true.
    pub async fn wait_closed(&self) {
        self.inner.closed_token.cancelled().await;
    }

    /// Number of live dispatchers.
    pub fn size(&self) -> usize {
        self.inner.state.lock().size
    }

    pub fn max_dispatchers(&self) -> usize {
        self.inner.state.lock().max_dispatchers
    }

    /// Updates the dispatcher ceiling. Nothing is started or stopped.
    pub fn set_max_dispatchers(&self, max: usize) {
        self.inner.state.lock().max_dispatchers = max;
    }

    /// Total workers across live dispatchers.
    pub fn worker_count(&self) -> usize {
        self.live_dispatchers()
            .iter()
            .map(|d| d.num_workers())
            .sum()
    }

    /// Stops `n` dispatchers (at least one). Each drains the jobs it already
    /// claimed; jobs still queued go to the remaining dispatchers.
    ///
    /// Rejected, returning `false`, if the pool is not running or the request
    /// would leave no dispatcher.
    pub fn stop_dispatch(&self, n: usize) -> bool {
        let mut state = self.inner.state.lock();
        state.prune_closed();
        let n = n.max(1).min(state.size);

        if !state.running || state.draining || state.closed || state.size <= n {
            #[cfg(feature = "tracing")]
            tracing::debug!(parent: &self.inner.span, "Rejected stop of {n} of {} dispatchers", state.size);
            return false;
        }

        let stopped = state
            .dispatchers
            .iter()
            .filter(|d| !d.stop_requested())
            .take(n)
            .inspect(|d| d.stop())
            .count();
        state.size -= stopped;

        #[cfg(feature = "tracing")]
        tracing::debug!(parent: &self.inner.span, "Stopped {stopped} dispatchers, {} remain", state.size);
        true
    }

    /// Starts `n` more dispatchers (at least one).
    ///
    /// Rejected, returning `false`, if the pool is not running or the total
    /// would exceed [`max_dispatchers`](Self::max_dispatchers).
    pub fn add_dispatch(&self, n: usize) -> bool {
        #[cfg(feature = "tracing")]
        let _entered = self.inner.span.enter();

        let n = n.max(1);
        {
            let mut state = self.inner.state.lock();
            state.prune_closed();
            if !state.can_grow(n) {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    "Rejected adding {n} dispatchers ({} running, max {})",
                    state.size,
                    state.max_dispatchers
                );
                return false;
            }
        }

        let handlers = self.create_handlers(n);
        let mut state = self.inner.state.lock();
        // Re-checked: the lock was released while the factory ran.
        if !state.can_grow(n) {
            #[cfg(feature = "tracing")]
            tracing::debug!("Rejected adding {n} dispatchers after a concurrent resize");
            return false;
        }

        for handler in handlers {
            if let Err(_e) = self.spawn_dispatcher(&mut state, handler) {
                #[cfg(feature = "tracing")]
                tracing::error!("Failed to start dispatcher: {_e}");
                return false;
            }
            state.size += 1;
        }
        true
    }

    /// Asks every live dispatcher to [`shrink`](Dispatcher::shrink) by `n`
    /// workers. Returns how many dispatchers accepted.
    pub fn shrink_workers(&self, n: usize) -> usize {
        self.live_dispatchers()
            .iter()
            .filter(|d| d.shrink(n))
            .count()
    }

    fn live_dispatchers(&self) -> Vec<Arc<PoolDispatcher<T, F>>> {
        self.inner
            .state
            .lock()
            .dispatchers
            .iter()
            .filter(|d| !d.stop_requested())
            .cloned()
            .collect()
    }
}

async fn listen<T, F>(inner: Arc<Inner<T, F>>)
where
    T: Send + 'static,
    F: HandlerFactory<T>,
{
    inner.done.cancelled().await;

    #[cfg(feature = "tracing")]
    tracing::debug!("Done signal received, closing job queue");

    inner.state.lock().draining = true;
    inner.queue.close();

    inner.drain_barrier.close();
    inner.drain_barrier.wait().await;

    inner.dispatcher_stop.cancel();
    let dispatchers = inner.state.lock().dispatchers.clone();
    join_all(dispatchers.iter().map(|d| d.wait_closed())).await;

    {
        let mut state = inner.state.lock();
        state.closed = true;
        state.size = 0;
    }

    if let Some((errors, _)) = &inner.errors {
        errors.close();
    }
    inner.closed_token.cancel();

    #[cfg(feature = "tracing")]
    tracing::info!("Pool closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::BoxError, observer::PoolStats};
    use core::time::Duration;
    use std::sync::OnceLock;
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(10);

    fn noop_factory() -> impl HandlerFactory<u32> {
        || |_job: Job<u32>| async { Ok::<(), BoxError>(()) }
    }

    fn pool(config: Config) -> (CancellationToken, Pool<u32, impl HandlerFactory<u32>>) {
        let done = CancellationToken::new();
        let pool = Pool::new(done.clone(), noop_factory(), config);
        (done, pool)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_twice_is_an_error() {
        let (done, pool) = pool(Config::default().with_workers(2));
        pool.start().unwrap();
        assert_eq!(pool.start(), Err(Error::AlreadyStarted));
        assert_eq!(pool.size(), 1);

        done.cancel();
        timeout(WAIT, pool.wait_closed()).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resizes_before_start_are_rejected() {
        let (done, pool) = pool(Config::default().with_init_dispatchers(2).with_workers(3));
        assert!(!pool.stop_dispatch(1));
        assert!(!pool.add_dispatch(1));
        assert_eq!(pool.shrink_workers(1), 0);
        assert_eq!(pool.size(), 0);

        pool.start().unwrap();
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.worker_count(), 6);

        done.cancel();
        timeout(WAIT, pool.wait_closed()).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_sequence_resets_size_and_rejects_resizes() {
        let (done, pool) = pool(
            Config::default()
                .with_init_dispatchers(2)
                .with_max_dispatchers(4)
                .with_workers(2)
                .with_errors(true),
        );
        pool.start().unwrap();
        let errors = pool.errors().unwrap();

        done.cancel();
        timeout(WAIT, pool.wait_closed()).await.unwrap();

        assert!(pool.closed());
        assert_eq!(pool.size(), 0);
        assert!(!pool.add_dispatch(1));
        assert!(!pool.stop_dispatch(1));
        assert!(pool.submit(1).await.unwrap_err().is_closed());
        // The error channel closes once the pool has.
        assert!(errors.recv().await.is_err());
    }

    #[test]
    fn invalid_config_is_reported_by_try_new() {
        let result = Pool::try_new(
            CancellationToken::new(),
            noop_factory(),
            Config::default().with_job_queue_capacity(0),
        );
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn errors_channel_is_opt_in() {
        let (_done, pool) = pool(Config::default());
        assert!(pool.errors().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stopped_dispatchers_are_forgotten() {
        let stats = Arc::new(PoolStats::new());
        let done = CancellationToken::new();
        let pool: Pool<u32, _> = Pool::builder(done.clone(), noop_factory())
            .config(Config::default().with_max_dispatchers(2).with_workers(2))
            .observer(stats.clone())
            .build()
            .unwrap();
        pool.start().unwrap();

        for _ in 0..200 {
            assert!(pool.add_dispatch(1));
            assert!(pool.stop_dispatch(1));
        }
        timeout(WAIT, async {
            while stats.snapshot().dispatchers_stopped < 200 {
                sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        // Rejected requests prune too.
        assert!(!pool.stop_dispatch(1));
        assert_eq!(pool.inner.state.lock().dispatchers.len(), 1);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.worker_count(), 2);

        done.cancel();
        timeout(WAIT, pool.wait_closed()).await.unwrap();
        assert_eq!(stats.snapshot().dispatchers_stopped, 201);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn factory_may_query_the_pool() {
        let pool_size: Arc<OnceLock<Box<dyn Fn() -> usize + Send + Sync>>> = Arc::default();
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let factory = {
            let pool_size = Arc::clone(&pool_size);
            let sizes = Arc::clone(&sizes);
            move || {
                if let Some(size) = pool_size.get() {
                    sizes.lock().push(size());
                }
                |_job: Job<u32>| async { Ok::<(), BoxError>(()) }
            }
        };

        let done = CancellationToken::new();
        let pool: Pool<u32, _> = Pool::new(
            done.clone(),
            factory,
            Config::default()
                .with_init_dispatchers(2)
                .with_max_dispatchers(3)
                .with_workers(2),
        );
        let handle = pool.clone();
        assert!(pool_size.set(Box::new(move || handle.size())).is_ok());

        pool.start().unwrap();
        assert!(pool.add_dispatch(1));
        assert_eq!(*sizes.lock(), vec![0, 0, 2]);
        assert_eq!(pool.size(), 3);

        done.cancel();
        timeout(WAIT, pool.wait_closed()).await.unwrap();
    }
}
