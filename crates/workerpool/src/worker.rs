//! A single execution lane.
//!
//! A worker loops through three steps: take an admission ticket from its
//! dispatcher, publish a fresh single-use delivery slot on the dispatcher's
//! availability channel, then run whatever job is placed in that slot. The
//! ticket/slot pair is what matches each job to exactly one idle worker.
//!
//! Stop signals are honoured while waiting for a ticket and while waiting for
//! the slot to be filled. In the second case the slot is closed first and a
//! job that was already delivered is still executed, so a stopping worker
//! never drops work.

use crate::{
    error::{BoxError, JobError},
    job::{Job, JobHandler},
    observer::PoolObserver,
};
use async_channel::{Receiver, Sender};
use futures::FutureExt;
use portable_atomic::{AtomicBool, Ordering};
use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Instant};
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;

/// Single-use delivery slot published by an idle worker.
pub(crate) type Slot<T> = oneshot::Sender<Job<T>>;

/// Channel ends a worker shares with its dispatcher.
pub(crate) struct WorkerLinks<T> {
    pub(crate) tickets: Receiver<()>,
    pub(crate) available: Sender<Slot<T>>,
    pub(crate) stop: Receiver<()>,
    pub(crate) errors: Option<Sender<JobError>>,
    pub(crate) observer: Arc<dyn PoolObserver>,
}

impl<T> Clone for WorkerLinks<T> {
    fn clone(&self) -> Self {
        Self {
            tickets: self.tickets.clone(),
            available: self.available.clone(),
            stop: self.stop.clone(),
            errors: self.errors.clone(),
            observer: Arc::clone(&self.observer),
        }
    }
}

/// Execution lane owned by one dispatcher.
///
/// Every worker of a dispatcher shares the dispatcher's handler and its
/// ticket, availability and stop channels. A worker runs at most one job at a
/// time and reports handler errors and panics instead of exiting on them.
pub(crate) struct Worker<T, H> {
    id: usize,
    dispatcher: usize,
    handler: Arc<H>,
    links: WorkerLinks<T>,
    closed: Arc<AtomicBool>,
}

/// Observer handle for a spawned worker.
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    id: usize,
    closed: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub const fn id(&self) -> usize {
        self.id
    }

    /// True once the worker has processed its stop signal. A closed worker
    /// never reopens.
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<T, H> Worker<T, H>
where
    T: Send + 'static,
    H: JobHandler<T>,
{
    /// Creates a worker that is not yet running; see [`spawn`](Self::spawn).
    ///
    /// # Arguments
    ///
    /// - `id`: Index of the worker within its dispatcher (used for
    ///   logs/tracing and observer callbacks).
    /// - `dispatcher`: Id of the owning dispatcher.
    /// - `handler`: The dispatcher's [`JobHandler`], shared by all of its
    ///   workers.
    /// - `links`: Ticket, availability and stop channels shared with the
    ///   dispatcher, plus the optional error sink and the observer.
    pub(crate) fn new(id: usize, dispatcher: usize, handler: Arc<H>, links: WorkerLinks<T>) -> Self {
        Self {
            id,
            dispatcher,
            handler,
            links,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawns the worker loop onto `tracker`, which doubles as the
    /// dispatcher's completion barrier for its workers.
    pub(crate) fn spawn(self, tracker: &TaskTracker) -> WorkerHandle {
        let handle = WorkerHandle {
            id: self.id,
            closed: Arc::clone(&self.closed),
        };

        #[cfg(feature = "tracing")]
        let fut = {
            use tracing::Instrument;
            let span = tracing::debug_span!("worker", dispatcher = self.dispatcher, worker = self.id);
            self.run().instrument(span)
        };
        #[cfg(not(feature = "tracing"))]
        let fut = self.run();

        tracker.spawn(fut);
        handle
    }

    async fn run(self) {
        #[cfg(feature = "tracing")]
        tracing::trace!("Worker started");

        loop {
            tokio::select! {
                biased;
                // A shrink token and a closed channel both mean stop.
                _ = self.links.stop.recv() => break,
                ticket = self.links.tickets.recv() => {
                    if ticket.is_err() || !self.rendezvous().await {
                        break;
                    }
                }
            }
        }

        self.closed.store(true, Ordering::Release);
        self.links.observer.worker_stopped(self.dispatcher, self.id);

        #[cfg(feature = "tracing")]
        tracing::trace!("Worker stopped");
    }

    /// Publishes a delivery slot and runs the job placed in it. Returns
    /// `false` when the worker must stop.
    async fn rendezvous(&self) -> bool {
        let (slot, mut fill) = oneshot::channel();
        if self.links.available.send(slot).await.is_err() {
            return false;
        }

        tokio::select! {
            biased;
            job = &mut fill => match job {
                Ok(job) => {
                    self.execute(job).await;
                    true
                }
                // Slot dropped unfilled: the availability channel was torn down.
                Err(_) => false,
            },
            _ = self.links.stop.recv() => {
                fill.close();
                if let Ok(job) = fill.try_recv() {
                    self.execute(job).await;
                }
                false
            }
        }
    }

    async fn execute(&self, job: Job<T>) {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.handler.handle(job))
            .catch_unwind()
            .await;

        let err = match outcome {
            Ok(Ok(())) => {
                self.links
                    .observer
                    .job_completed(self.dispatcher, self.id, started.elapsed());
                return;
            }
            Ok(Err(source)) => self.failed(source),
            Err(panic) => JobError::Panicked {
                dispatcher: self.dispatcher,
                worker: self.id,
                message: panic_message(panic.as_ref()),
            },
        };

        #[cfg(feature = "tracing")]
        tracing::warn!("Error handling job: {err}");
        self.links.observer.job_failed(&err);

        if let Some(errors) = &self.links.errors {
            // Blocks while the error buffer is full; draining it is the
            // consumer's job.
            if let Err(_e) = errors.send(err).await {
                #[cfg(feature = "tracing")]
                tracing::debug!("Error channel closed, dropping: {}", _e.into_inner());
            }
        }
    }

    fn failed(&self, source: BoxError) -> JobError {
        JobError::Failed {
            dispatcher: self.dispatcher,
            worker: self.id,
            source,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{NoopObserver, PoolStats};
    use core::time::Duration;
    use tokio::time::timeout;

    struct Harness {
        tickets: Sender<()>,
        available: Receiver<Slot<u32>>,
        stop: Sender<()>,
        errors: Receiver<JobError>,
        links: WorkerLinks<u32>,
    }

    fn harness(observer: Arc<dyn PoolObserver>) -> Harness {
        let (tickets_tx, tickets_rx) = async_channel::bounded(4);
        let (available_tx, available_rx) = async_channel::bounded(4);
        let (stop_tx, stop_rx) = async_channel::bounded(4);
        let (errors_tx, errors_rx) = async_channel::bounded(4);
        Harness {
            tickets: tickets_tx,
            available: available_rx,
            stop: stop_tx,
            errors: errors_rx,
            links: WorkerLinks {
                tickets: tickets_rx,
                available: available_tx,
                stop: stop_rx,
                errors: Some(errors_tx),
                observer,
            },
        }
    }

    async fn deliver(h: &Harness, value: u32) {
        h.tickets.send(()).await.unwrap();
        let slot = h.available.recv().await.unwrap();
        assert!(slot.send(Job::new(value)).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runs_delivered_jobs_and_reports_errors() {
        let stats = Arc::new(PoolStats::new());
        let h = harness(stats.clone());
        let handler = Arc::new(|job: Job<u32>| async move {
            match job.into_inner() {
                3 => Err::<(), BoxError>("three".into()),
                13 => panic!("unlucky"),
                _ => Ok(()),
            }
        });

        let tracker = TaskTracker::new();
        let handle = Worker::new(7, 1, handler, h.links.clone()).spawn(&tracker);

        for value in [1, 3, 13, 4] {
            deliver(&h, value).await;
        }

        let first = timeout(Duration::from_secs(5), h.errors.recv()).await.unwrap().unwrap();
        assert!(matches!(first, JobError::Failed { dispatcher: 1, worker: 7, .. }));
        let second = timeout(Duration::from_secs(5), h.errors.recv()).await.unwrap().unwrap();
        assert!(matches!(&second, JobError::Panicked { message, .. } if message == "unlucky"));

        h.stop.close();
        tracker.close();
        timeout(Duration::from_secs(5), tracker.wait()).await.unwrap();

        assert!(handle.closed());
        let snap = stats.snapshot();
        assert_eq!(snap.completed, 2);
        assert_eq!(snap.failed, 2);
        assert_eq!(snap.workers_stopped, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_while_waiting_for_fill_closes_the_slot() {
        let h = harness(Arc::new(NoopObserver));
        let handler = Arc::new(|_job: Job<u32>| async { Ok::<(), BoxError>(()) });

        let tracker = TaskTracker::new();
        let handle = Worker::new(0, 0, handler, h.links.clone()).spawn(&tracker);

        // Hand out a ticket but hold on to the published slot.
        h.tickets.send(()).await.unwrap();
        let slot = timeout(Duration::from_secs(5), h.available.recv()).await.unwrap().unwrap();

        h.stop.send(()).await.unwrap();
        tracker.close();
        timeout(Duration::from_secs(5), tracker.wait()).await.unwrap();

        assert!(handle.closed());
        // The slot was closed, so the job comes back instead of being lost.
        let job = slot.send(Job::new(9)).unwrap_err();
        assert_eq!(job.into_inner(), 9);
    }
}
