use super::config::{Resizes, RunnerConfig};
use core::time::Duration;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use workerpool::{BoxError, HandlerFactory, Job, JobQueue, Pool, PoolStats, StatsSnapshot};

/// Outcome of a single run.
#[derive(Debug, Clone)]
pub struct Summary {
    pub submitted: u64,
    pub submitted_sum: u64,
    pub handled_sum: u64,
    pub errors_received: u64,
    pub stats: StatsSnapshot,
    pub elapsed: Duration,
}

impl Summary {
    /// Every accepted job was handled exactly once.
    pub fn is_consistent(&self) -> bool {
        self.stats.handled() == self.submitted
    }

    pub fn throughput(&self) -> f64 {
        self.stats.handled() as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON)
    }
}

/// Sums payloads after `work` of simulated latency, failing every multiple
/// of `fail_every`.
fn summing(
    sum: Arc<AtomicU64>,
    work: Duration,
    fail_every: Option<u64>,
) -> impl HandlerFactory<u64> {
    move || {
        let sum = Arc::clone(&sum);
        move |job: Job<u64>| {
            let sum = Arc::clone(&sum);
            async move {
                if !work.is_zero() {
                    tokio::time::sleep(work).await;
                }
                let value = job.into_inner();
                if fail_every.is_some_and(|n| value % n == 0) {
                    return Err::<(), BoxError>(format!("payload {value} is rejected").into());
                }
                sum.fetch_add(value, Ordering::Relaxed);
                Ok(())
            }
        }
    }
}

/// Submits every `stride`-th payload starting at `first`. Returns the
/// number and sum of accepted jobs; stops early once the queue closes or the
/// next payload would overflow. The sum wraps like the handler's counter.
async fn produce(queue: JobQueue<u64>, first: u64, stride: u64, last: u64) -> (u64, u64) {
    let (mut count, mut sum) = (0_u64, 0_u64);
    let mut next = Some(first);
    while let Some(value) = next.filter(|v| *v <= last) {
        if queue.send(value).await.is_err() {
            tracing::debug!("Job queue closed, producer stopping at {value}");
            break;
        }
        count += 1;
        sum = sum.wrapping_add(value);
        next = value.checked_add(stride);
    }
    (count, sum)
}

fn apply_resizes(pool: &Pool<u64, impl HandlerFactory<u64>>, resizes: Resizes) {
    if resizes.add_dispatch > 0 {
        let added = pool.add_dispatch(resizes.add_dispatch);
        tracing::info!(
            "Add {} dispatchers: {} (size {}, max {})",
            resizes.add_dispatch,
            if added { "accepted" } else { "rejected" },
            pool.size(),
            pool.max_dispatchers()
        );
    }
    if resizes.stop_dispatch > 0 {
        let stopped = pool.stop_dispatch(resizes.stop_dispatch);
        tracing::info!(
            "Stop {} dispatchers: {} (size {})",
            resizes.stop_dispatch,
            if stopped { "accepted" } else { "rejected" },
            pool.size()
        );
    }
    if resizes.shrink_workers > 0 {
        let accepted = pool.shrink_workers(resizes.shrink_workers);
        tracing::info!(
            "Shrink by {} workers accepted by {accepted} dispatchers ({} workers)",
            resizes.shrink_workers,
            pool.worker_count()
        );
    }
}

/// Runs the workload until every job is submitted or `done` is cancelled,
/// then waits for the pool to drain and close.
pub async fn run(config: RunnerConfig, done: CancellationToken) -> anyhow::Result<Summary> {
    let started = Instant::now();
    let handled_sum = Arc::new(AtomicU64::new(0));
    let stats = Arc::new(PoolStats::new());

    let pool: Pool<u64, _> = Pool::builder(
        done.clone(),
        summing(Arc::clone(&handled_sum), config.work, config.fail_every),
    )
    .config(config.pool.clone())
    .observer(stats.clone())
    .build()?;
    pool.start()?;

    let error_drain = pool.errors().map(|errors| {
        tokio::spawn(async move {
            let mut received = 0;
            while let Ok(err) = errors.recv().await {
                tracing::trace!("Reported: {err}");
                received += 1;
            }
            received
        })
    });

    let mut producers = JoinSet::new();
    let stride = config.producers as u64;
    for first in 1..=stride {
        producers.spawn(produce(pool.queue(), first, stride, config.jobs));
    }

    if !config.resizes.is_empty() {
        apply_resizes(&pool, config.resizes);
    }

    let (mut submitted, mut submitted_sum) = (0_u64, 0_u64);
    while let Some(result) = producers.join_next().await {
        let (count, sum) = result?;
        submitted += count;
        submitted_sum = submitted_sum.wrapping_add(sum);
    }

    if done.is_cancelled() {
        tracing::info!("Interrupted after {submitted} jobs, draining");
    } else {
        tracing::info!("All {submitted} jobs submitted, draining");
        done.cancel();
    }
    pool.wait_closed().await;

    let errors_received = match error_drain {
        Some(task) => task.await?,
        None => 0,
    };

    Ok(Summary {
        submitted,
        submitted_sum,
        handled_sum: handled_sum.load(Ordering::Relaxed),
        errors_received,
        stats: stats.snapshot(),
        elapsed: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use workerpool::Config;

    fn config(fail_every: Option<u64>, resizes: Resizes) -> RunnerConfig {
        RunnerConfig {
            pool: Config::default()
                .with_init_dispatchers(2)
                .with_max_dispatchers(4)
                .with_workers(4)
                .with_job_queue_capacity(16)
                .with_errors(fail_every.is_some())
                .with_error_buffer_size(16),
            jobs: 1_000,
            work: Duration::ZERO,
            fail_every,
            producers: 3,
            resizes,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn workload_is_handled_exactly_once() {
        let summary = run(
            config(
                None,
                Resizes {
                    add_dispatch: 1,
                    stop_dispatch: 1,
                    shrink_workers: 1,
                },
            ),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(summary.submitted, 1_000);
        assert_eq!(summary.submitted_sum, 500_500);
        assert_eq!(summary.handled_sum, 500_500);
        assert!(summary.is_consistent());
        assert_eq!(summary.errors_received, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failures_are_counted_and_reported() {
        let summary = run(config(Some(10), Resizes::default()), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.stats.failed, 100);
        assert_eq!(summary.errors_received, 100);
        // Multiples of ten sum to 50_500.
        assert_eq!(summary.handled_sum, 500_500 - 50_500);
        assert!(summary.is_consistent());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancelled_run_still_drains_accepted_jobs() {
        let done = CancellationToken::new();
        done.cancel();
        let summary = run(config(None, Resizes::default()), done).await.unwrap();

        assert!(summary.submitted <= 1_000);
        assert_eq!(summary.handled_sum, summary.submitted_sum);
        assert!(summary.is_consistent());
    }

    #[tokio::test]
    async fn producer_stops_before_payload_overflow() {
        let (queue, rx) = JobQueue::bounded(4);
        let (count, sum) = produce(queue, u64::MAX - 1, 4, u64::MAX).await;

        assert_eq!(count, 1);
        assert_eq!(sum, u64::MAX - 1);
        assert_eq!(rx.recv().await.unwrap().into_inner(), u64::MAX - 1);
        assert!(rx.is_empty());
    }
}
