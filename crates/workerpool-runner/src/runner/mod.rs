//! Components of the `workerpool-runner` binary.
//!
//! - [`config`] - CLI/environment parsing into a validated [`RunnerConfig`].
//! - [`telemetry`] - `tracing-subscriber` console output.
//! - [`workload`] - producers, the summing handler and the run summary.
//!
//! [`RunnerConfig`]: config::RunnerConfig

pub mod config;
pub mod telemetry;
pub mod workload;
