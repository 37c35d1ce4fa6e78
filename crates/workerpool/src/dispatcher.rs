//! Routes jobs from a shared queue to a fixed-at-a-time set of workers.
//!
//! The dispatch loop only ever waits on two things: the next job from the
//! shared queue, or its own stop signal. Each claimed job is handed to a
//! short-lived delivery task which takes an admission ticket (at most
//! `workers` tickets can be outstanding), waits for an idle worker's
//! delivery slot, and fills it. Draining the queue is therefore decoupled
//! from worker availability.
//!
//! Shutdown runs at most once and in a fixed order: wait for every delivery
//! task, close the worker stop channel, wait for every worker to exit, then
//! tear down the ticket and availability channels. No channel is closed
//! while a worker or delivery task could still use it.

use crate::{
    error::{Error, JobError, Result},
    job::{Job, JobHandler, JobReceiver},
    observer::{NoopObserver, PoolObserver},
    worker::{Slot, Worker, WorkerHandle, WorkerLinks},
};
use async_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::{
    sync::CancellationToken,
    task::{TaskTracker, task_tracker::TaskTrackerToken},
};

#[derive(Default)]
struct State {
    num_workers: usize,
    running: bool,
    draining: bool,
    closed: bool,
    workers: Vec<WorkerHandle>,
}

/// Load-balances jobs across the workers it owns.
///
/// A dispatcher is usually created by a [`Pool`](crate::Pool), but it can be
/// driven directly from any [`JobReceiver`]:
///
/// ```
/// # use std::sync::Arc;
/// # use workerpool::{BoxError, Dispatcher, Job, JobQueue};
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let (queue, rx) = JobQueue::bounded(16);
/// let dispatcher = Arc::new(Dispatcher::new(0, 4, rx, |job: Job<u64>| async move {
///     let _ = job.into_inner();
///     Ok::<(), BoxError>(())
/// }));
/// dispatcher.run()?;
///
/// queue.send(42).await?;
/// while !queue.is_empty() {
///     tokio::task::yield_now().await;
/// }
///
/// // Jobs already claimed finish before the dispatcher reports closed.
/// dispatcher.stop();
/// dispatcher.wait_closed().await;
/// assert!(dispatcher.closed());
/// # Ok(())
/// # }
/// ```
pub struct Dispatcher<T, H> {
    id: usize,
    handler: Arc<H>,
    queue: JobReceiver<T>,
    stop: CancellationToken,
    drain_token: Mutex<Option<TaskTrackerToken>>,
    worker_floor: usize,
    errors: Option<Sender<JobError>>,
    observer: Arc<dyn PoolObserver>,
    ticket_tx: Sender<()>,
    ticket_rx: Receiver<()>,
    available_tx: Sender<Slot<T>>,
    available_rx: Receiver<Slot<T>>,
    worker_stop_tx: Sender<()>,
    worker_stop_rx: Receiver<()>,
    workers: TaskTracker,
    in_flight: TaskTracker,
    shutdown: OnceCell<()>,
    closed_token: CancellationToken,
    state: Mutex<State>,
}

impl<T, H> Dispatcher<T, H>
where
    T: Send + 'static,
    H: JobHandler<T>,
{
    /// Creates a dispatcher that will own `num_workers` workers, all running
    /// `handler`. Nothing runs until [`run`](Self::run) is called.
    ///
    /// Without [`with_stop`](Self::with_stop) the dispatcher only stops when
    /// `queue` closes or [`stop`](Self::stop) is called. The remaining
    /// `with_*` methods attach an error sink, an observer, a worker floor and
    /// a drain token.
    ///
    /// # Arguments
    ///
    /// - `id`: Identifier reported in logs/tracing and observer callbacks.
    /// - `num_workers`: Workers spawned by `run`. Also the capacity of the
    ///   ticket, availability and shrink channels.
    /// - `queue`: Receiving end of the job queue. Several dispatchers may
    ///   share clones of it and compete for jobs.
    /// - `handler`: Runs every job this dispatcher claims.
    ///
    /// # Panics
    ///
    /// Panics if `num_workers` is zero.
    pub fn new(id: usize, num_workers: usize, queue: JobReceiver<T>, handler: H) -> Self {
        let (ticket_tx, ticket_rx) = async_channel::bounded(num_workers);
        let (available_tx, available_rx) = async_channel::bounded(num_workers);
        let (worker_stop_tx, worker_stop_rx) = async_channel::bounded(num_workers);

        Self {
            id,
            handler: Arc::new(handler),
            queue,
            stop: CancellationToken::new(),
            drain_token: Mutex::new(None),
            worker_floor: 1,
            errors: None,
            observer: Arc::new(NoopObserver),
            ticket_tx,
            ticket_rx,
            available_tx,
            available_rx,
            worker_stop_tx,
            worker_stop_rx,
            workers: TaskTracker::new(),
            in_flight: TaskTracker::new(),
            shutdown: OnceCell::new(),
            closed_token: CancellationToken::new(),
            state: Mutex::new(State {
                num_workers,
                ..State::default()
            }),
        }
    }

    /// Uses `stop` as the external stop signal instead of a private token.
    #[must_use]
    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    /// Forwards failed jobs to `errors`.
    #[must_use]
    pub fn with_errors(mut self, errors: Sender<JobError>) -> Self {
        self.errors = Some(errors);
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn PoolObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// A [`shrink`](Self::shrink) must leave strictly more than `floor`
    /// workers. Defaults to 1.
    #[must_use]
    pub fn with_worker_floor(mut self, floor: usize) -> Self {
        self.worker_floor = floor;
        self
    }

    /// Holds `token` until this dispatcher's share of the queue has drained.
    #[must_use]
    pub fn with_drain_token(self, token: TaskTrackerToken) -> Self {
        *self.drain_token.lock() = Some(token);
        self
    }

    pub const fn id(&self) -> usize {
        self.id
    }

    /// Spawns the workers and the dispatch loop onto the current Tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] if called more than once.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn run(self: &Arc<Self>) -> Result<()> {
        let num_workers = {
            let mut state = self.state.lock();
            if state.running {
                return Err(Error::AlreadyRunning { id: self.id });
            }
            state.running = true;
            state.num_workers
        };

        #[cfg(feature = "tracing")]
        let span = tracing::debug_span!("dispatcher", id = self.id);
        #[cfg(feature = "tracing")]
        let _entered = span.enter();

        let links = WorkerLinks {
            tickets: self.ticket_rx.clone(),
            available: self.available_tx.clone(),
            stop: self.worker_stop_rx.clone(),
            errors: self.errors.clone(),
            observer: Arc::clone(&self.observer),
        };
        let handles: Vec<_> = (0..num_workers)
            .map(|id| {
                Worker::new(id, self.id, Arc::clone(&self.handler), links.clone())
                    .spawn(&self.workers)
            })
            .collect();
        self.state.lock().workers = handles;

        let fut = Arc::clone(self).dispatch();
        #[cfg(feature = "tracing")]
        let fut = {
            use tracing::Instrument;
            fut.instrument(span.clone())
        };
        tokio::spawn(fut);

        #[cfg(feature = "tracing")]
        tracing::debug!("Dispatcher running with {num_workers} workers");
        Ok(())
    }

    async fn dispatch(self: Arc<Self>) {
        loop {
            tokio::select! {
                () = self.stop.cancelled() => break,
                job = self.queue.recv() => match job {
                    Ok(job) => self.hand_off(job),
                    Err(_) => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!("Job queue closed, draining");
                        self.shutdown_workers().await;
                        self.release_drain_token();
                        self.stop.cancelled().await;
                        break;
                    }
                }
            }
        }

        self.shutdown_workers().await;
        self.release_drain_token();
        self.state.lock().closed = true;
        self.observer.dispatcher_stopped(self.id);
        self.closed_token.cancel();

        #[cfg(feature = "tracing")]
        tracing::debug!("Dispatcher closed");
    }

    fn hand_off(&self, job: Job<T>) {
        self.observer.job_dispatched(self.id);

        let tickets = self.ticket_tx.clone();
        let available = self.available_rx.clone();
        let fut = async move {
            if let Err(_job) = deliver(job, &tickets, &available).await {
                #[cfg(feature = "tracing")]
                tracing::error!("Workers shut down before a claimed job could be delivered");
            }
        };
        #[cfg(feature = "tracing")]
        let fut = {
            use tracing::Instrument;
            fut.in_current_span()
        };
        self.in_flight.spawn(fut);
    }

    /// Drains in-flight deliveries, stops every worker and waits for them to
    /// exit. Idempotent; concurrent callers wait for the first to finish.
    async fn shutdown_workers(&self) {
        self.shutdown
            .get_or_init(|| async {
                self.state.lock().draining = true;

                self.in_flight.close();
                self.in_flight.wait().await;

                self.worker_stop_tx.close();
                self.workers.close();
                self.workers.wait().await;

                self.available_tx.close();
                self.ticket_tx.close();

                #[cfg(feature = "tracing")]
                tracing::debug!("All workers stopped");
            })
            .await;
    }

    fn release_drain_token(&self) {
        drop(self.drain_token.lock().take());
    }

    /// True once the dispatcher has processed its stop signal and every job
    /// it claimed has finished.
    pub fn closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn num_workers(&self) -> usize {
        self.state.lock().num_workers
    }

    /// Handles for the workers spawned by [`run`](Self::run), including ones
    /// that have since been stopped.
    pub fn workers(&self) -> Vec<WorkerHandle> {
        self.state.lock().workers.clone()
    }

    /// Sends the external stop signal. The dispatcher drains its in-flight
    /// jobs before closing.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Waits until [`closed`](Self::closed) is true.
    pub async fn wait_closed(&self) {
        self.closed_token.cancelled().await;
    }

    /// Stops `n` idle workers (at least one, at most all).
    ///
    /// The request is rejected as a whole, returning `false`, if the
    /// dispatcher is not running, is stopping, or would be left with
    /// `worker_floor` workers or fewer.
    pub fn shrink(&self, n: usize) -> bool {
        let mut state = self.state.lock();
        let n = n.max(1).min(state.num_workers);

        if !state.running
            || state.draining
            || state.closed
            || self.stop.is_cancelled()
            || state.num_workers - n <= self.worker_floor
        {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                dispatcher = self.id,
                "Rejected shrink by {n} ({} workers, floor {})",
                state.num_workers,
                self.worker_floor
            );
            return false;
        }

        // Capacity equals the initial worker count and at most that many
        // tokens are ever sent, so this cannot fill up.
        let sent = (0..n)
            .take_while(|_| self.worker_stop_tx.try_send(()).is_ok())
            .count();
        state.num_workers -= sent;
        sent == n
    }
}

/// Moves one job into an idle worker's slot.
///
/// A slot can belong to a worker that stopped after publishing it; the send
/// then fails and the job is retried with a fresh ticket. Returns the job
/// only if the dispatcher's channels have been torn down.
async fn deliver<T>(
    mut job: Job<T>,
    tickets: &Sender<()>,
    available: &Receiver<Slot<T>>,
) -> core::result::Result<(), Job<T>> {
    loop {
        if tickets.send(()).await.is_err() {
            return Err(job);
        }
        let Ok(slot) = available.recv().await else {
            return Err(job);
        };
        match slot.send(job) {
            Ok(()) => return Ok(()),
            Err(returned) => job = returned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::BoxError, job::JobQueue, observer::PoolStats};
    use core::time::Duration;
    use portable_atomic::{AtomicU64, Ordering};
    use tokio::{
        sync::oneshot,
        time::{sleep, timeout},
    };

    const WAIT: Duration = Duration::from_secs(10);

    fn summing(
        total: Arc<AtomicU64>,
        work: Duration,
    ) -> impl JobHandler<u64> {
        move |job: Job<u64>| {
            let total = Arc::clone(&total);
            async move {
                sleep(work).await;
                total.fetch_add(job.into_inner(), Ordering::Relaxed);
                Ok::<(), BoxError>(())
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn drains_queue_then_closes_on_stop() {
        let total = Arc::new(AtomicU64::new(0));
        let stats = Arc::new(PoolStats::new());
        let (queue, rx) = JobQueue::bounded(8);
        let dispatcher = Arc::new(
            Dispatcher::new(0, 3, rx, summing(total.clone(), Duration::from_millis(2)))
                .with_observer(stats.clone()),
        );
        dispatcher.run().unwrap();

        for i in 1..=50 {
            queue.send(i).await.unwrap();
        }
        drop(queue);

        // The queue closing drains the dispatcher but only the stop signal
        // marks it closed.
        timeout(WAIT, async {
            while stats.snapshot().workers_stopped < 3 {
                sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        assert!(!dispatcher.closed());
        assert_eq!(total.load(Ordering::Relaxed), 1275);

        dispatcher.stop();
        timeout(WAIT, dispatcher.wait_closed()).await.unwrap();
        assert!(dispatcher.closed());
        assert!(dispatcher.workers().iter().all(WorkerHandle::closed));

        let snap = stats.snapshot();
        assert_eq!(snap.dispatched, 50);
        assert_eq!(snap.completed, 50);
        assert_eq!(snap.workers_stopped, 3);
        assert_eq!(snap.dispatchers_stopped, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_waits_for_in_flight_jobs() {
        let total = Arc::new(AtomicU64::new(0));
        let (queue, rx) = JobQueue::bounded(16);
        let dispatcher = Arc::new(Dispatcher::new(
            3,
            2,
            rx,
            summing(total.clone(), Duration::from_millis(50)),
        ));
        dispatcher.run().unwrap();

        for _ in 0..4 {
            queue.send(1).await.unwrap();
        }
        // Let the loop claim the jobs before stopping.
        while !queue.is_empty() {
            sleep(Duration::from_millis(1)).await;
        }

        dispatcher.stop();
        timeout(WAIT, dispatcher.wait_closed()).await.unwrap();
        assert_eq!(total.load(Ordering::Relaxed), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shrink_respects_floor() {
        let (_queue, rx) = JobQueue::<u64>::bounded(1);
        let dispatcher = Arc::new(Dispatcher::new(
            0,
            4,
            rx,
            summing(Arc::default(), Duration::ZERO),
        ));

        // Not running yet.
        assert!(!dispatcher.shrink(1));
        dispatcher.run().unwrap();

        // 4 - 3 = 1 is not above the floor of 1.
        assert!(!dispatcher.shrink(3));
        assert_eq!(dispatcher.num_workers(), 4);

        assert!(dispatcher.shrink(2));
        assert_eq!(dispatcher.num_workers(), 2);
        assert!(!dispatcher.shrink(1));
        assert_eq!(dispatcher.num_workers(), 2);

        // Exactly two workers observe their stop token.
        timeout(WAIT, async {
            while dispatcher.workers().iter().filter(|w| w.closed()).count() < 2 {
                sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        dispatcher.stop();
        timeout(WAIT, dispatcher.wait_closed()).await.unwrap();
        assert!(!dispatcher.shrink(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn zero_floor_keeps_one_worker() {
        let total = Arc::new(AtomicU64::new(0));
        let (queue, rx) = JobQueue::bounded(4);
        let dispatcher = Arc::new(
            Dispatcher::new(0, 3, rx, summing(total.clone(), Duration::ZERO))
                .with_worker_floor(0),
        );
        dispatcher.run().unwrap();

        assert!(!dispatcher.shrink(3));
        assert!(dispatcher.shrink(2));
        assert_eq!(dispatcher.num_workers(), 1);

        for i in 0..10 {
            queue.send(i).await.unwrap();
        }
        timeout(WAIT, async {
            while total.load(Ordering::Relaxed) < 45 {
                sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        dispatcher.stop();
        timeout(WAIT, dispatcher.wait_closed()).await.unwrap();
        assert_eq!(total.load(Ordering::Relaxed), 45);
    }

    #[tokio::test]
    async fn run_twice_is_an_error() {
        let (_queue, rx) = JobQueue::<u64>::bounded(1);
        let dispatcher = Arc::new(Dispatcher::new(
            9,
            1,
            rx,
            summing(Arc::default(), Duration::ZERO),
        ));
        dispatcher.run().unwrap();
        assert_eq!(dispatcher.run(), Err(Error::AlreadyRunning { id: 9 }));
        dispatcher.stop();
        timeout(WAIT, dispatcher.wait_closed()).await.unwrap();
    }

    #[tokio::test]
    async fn deliver_retries_past_a_stopped_workers_slot() {
        let (tickets_tx, tickets_rx) = async_channel::bounded(4);
        let (available_tx, available_rx) = async_channel::bounded::<Slot<u64>>(4);

        // A worker that published its slot and then stopped.
        let (stale, stale_rx) = oneshot::channel();
        drop(stale_rx);
        let (live, live_rx) = oneshot::channel();
        available_tx.send(stale).await.unwrap();
        available_tx.send(live).await.unwrap();

        deliver(Job::new(5), &tickets_tx, &available_rx).await.unwrap();
        assert_eq!(live_rx.await.unwrap().into_inner(), 5);
        // One ticket per attempt.
        assert_eq!(tickets_rx.len(), 2);

        // Torn-down channels hand the job back.
        available_tx.close();
        let returned = deliver(Job::new(6), &tickets_tx, &available_rx).await;
        assert_eq!(returned, Err(Job::new(6)));
    }
}
