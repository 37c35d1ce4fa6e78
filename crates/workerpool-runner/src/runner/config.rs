use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use workerpool::Config;

/// Runtime configuration for the `workerpool-runner` binary.
///
/// These settings shape the pool under test and the synthetic workload fed
/// into it. All values are parsed from CLI arguments or environment
/// variables (a `.env` file is honoured), with defaults matching the
/// library's own.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "workerpool-runner",
    version,
    about = "Drives a workerpool with a synthetic integer workload"
)]
pub struct CliArgs {
    /// Dispatchers started with the pool.
    ///
    /// Environment variable: `WORKERPOOL_DISPATCHERS`
    #[arg(long, env = "WORKERPOOL_DISPATCHERS", default_value_t = 1)]
    pub dispatchers: usize,

    /// Ceiling for dispatchers added at runtime. Raised to `dispatchers` if
    /// lower.
    ///
    /// Environment variable: `WORKERPOOL_MAX_DISPATCHERS`
    #[arg(long, env = "WORKERPOOL_MAX_DISPATCHERS", default_value_t = 3)]
    pub max_dispatchers: usize,

    /// Workers owned by each dispatcher.
    ///
    /// Environment variable: `WORKERPOOL_WORKERS`
    #[arg(long, env = "WORKERPOOL_WORKERS", default_value_t = 20)]
    pub workers: usize,

    /// Capacity of the shared job queue. Producers wait while it is full.
    ///
    /// Environment variable: `WORKERPOOL_QUEUE_CAPACITY`
    #[arg(long, env = "WORKERPOOL_QUEUE_CAPACITY", default_value_t = 1000)]
    pub queue_capacity: usize,

    /// Number of jobs to submit. Each carries an integer payload from 1 to
    /// `jobs`.
    ///
    /// Environment variable: `WORKERPOOL_JOBS`
    #[arg(long, env = "WORKERPOOL_JOBS", default_value_t = 10_000)]
    pub jobs: u64,

    /// Simulated handler latency, in milliseconds.
    ///
    /// Environment variable: `WORKERPOOL_WORK_MS`
    #[arg(long, env = "WORKERPOOL_WORK_MS", default_value_t = 1)]
    pub work_ms: u64,

    /// Fail every job whose payload is a multiple of this value. Zero
    /// disables failures.
    ///
    /// Environment variable: `WORKERPOOL_FAIL_EVERY`
    #[arg(long, env = "WORKERPOOL_FAIL_EVERY", default_value_t = 0)]
    pub fail_every: u64,

    /// Concurrent producer tasks.
    ///
    /// Environment variable: `WORKERPOOL_PRODUCERS`
    #[arg(long, env = "WORKERPOOL_PRODUCERS", default_value_t = 4)]
    pub producers: usize,

    /// Dispatchers to add once the workload is running.
    ///
    /// Environment variable: `WORKERPOOL_ADD_DISPATCH`
    #[arg(long, env = "WORKERPOOL_ADD_DISPATCH", default_value_t = 0)]
    pub add_dispatch: usize,

    /// Dispatchers to stop once the workload is running.
    ///
    /// Environment variable: `WORKERPOOL_STOP_DISPATCH`
    #[arg(long, env = "WORKERPOOL_STOP_DISPATCH", default_value_t = 0)]
    pub stop_dispatch: usize,

    /// Workers to remove from every dispatcher once the workload is running.
    ///
    /// Environment variable: `WORKERPOOL_SHRINK_WORKERS`
    #[arg(long, env = "WORKERPOOL_SHRINK_WORKERS", default_value_t = 0)]
    pub shrink_workers: usize,

    /// Label attached to the pool's log spans.
    ///
    /// Environment variable: `WORKERPOOL_NAME`
    #[arg(long, env = "WORKERPOOL_NAME", default_value_t = String::from("runner"))]
    pub name: String,
}

/// Resize requests issued once producers are running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resizes {
    pub add_dispatch: usize,
    pub stop_dispatch: usize,
    pub shrink_workers: usize,
}

impl Resizes {
    pub const fn is_empty(&self) -> bool {
        self.add_dispatch == 0 && self.stop_dispatch == 0 && self.shrink_workers == 0
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub pool: Config,
    pub jobs: u64,
    pub work: Duration,
    pub fail_every: Option<u64>,
    pub producers: usize,
    pub resizes: Resizes,
}

impl TryFrom<CliArgs> for RunnerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.producers == 0 {
            bail!("WORKERPOOL_PRODUCERS must be greater than 0");
        }

        let pool = Config::default()
            .with_init_dispatchers(args.dispatchers)
            .with_max_dispatchers(args.max_dispatchers)
            .with_workers(args.workers)
            .with_job_queue_capacity(args.queue_capacity)
            .with_errors(args.fail_every > 0)
            .with_error_buffer_size(args.queue_capacity)
            .with_name(args.name);
        pool.validate()?;

        Ok(Self {
            pool,
            jobs: args.jobs,
            work: Duration::from_millis(args.work_ms),
            fail_every: (args.fail_every > 0).then_some(args.fail_every),
            producers: args.producers,
            resizes: Resizes {
                add_dispatch: args.add_dispatch,
                stop_dispatch: args.stop_dispatch,
                shrink_workers: args.shrink_workers,
            },
        })
    }
}
