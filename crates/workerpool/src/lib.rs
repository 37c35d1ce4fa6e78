//! A runtime-adjustable pool of async workers.
//!
//! A [`Pool`] owns one or more [`Dispatcher`]s that compete to read a single
//! bounded job queue. Each dispatcher owns a set of workers and hands every
//! job it claims to exactly one idle worker. Dispatchers can be added or
//! stopped and workers shrunk while the pool runs. Cancelling the pool's done
//! token drains every queued job before anything is stopped.

mod config;
mod dispatcher;
mod error;
mod job;
mod observer;
mod pool;
mod worker;

pub use crate::config::*;
pub use crate::dispatcher::*;
pub use crate::error::*;
pub use crate::job::*;
pub use crate::observer::*;
pub use crate::pool::*;
pub use crate::worker::WorkerHandle;
