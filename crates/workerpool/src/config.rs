use crate::error::{Error, Result};

/// Tunables for a [`Pool`](crate::Pool).
///
/// Every pool gets its own value; there is no process-wide default state.
/// Start from [`Config::default`] and override with the `with_*` methods.
///
/// ```
/// use workerpool::Config;
///
/// let config = Config::default()
///     .with_init_dispatchers(2)
///     .with_workers(5)
///     .with_errors(true);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Dispatchers started by [`Pool::start`](crate::Pool::start).
    pub init_dispatchers: usize,
    /// Ceiling for [`Pool::add_dispatch`](crate::Pool::add_dispatch).
    pub max_dispatchers: usize,
    /// Workers owned by each dispatcher.
    pub workers: usize,
    /// Capacity of the shared job queue.
    pub job_queue_capacity: usize,
    /// Forward failed jobs on the pool's error channel.
    pub errors_enabled: bool,
    /// Capacity of the error channel. Workers wait for room when it is full,
    /// so consumers are expected to keep draining it.
    pub error_buffer_size: usize,
    /// A dispatcher shrink must leave strictly more than this many workers.
    pub worker_floor: usize,
    /// Label attached to every log span emitted by the pool.
    pub name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            init_dispatchers: 1,
            max_dispatchers: 3,
            workers: 20,
            job_queue_capacity: 1000,
            errors_enabled: false,
            error_buffer_size: 1,
            worker_floor: 1,
            name: "workerpool".to_string(),
        }
    }
}

impl Config {
    #[must_use]
    pub fn with_init_dispatchers(mut self, n: usize) -> Self {
        self.init_dispatchers = n;
        self
    }

    #[must_use]
    pub fn with_max_dispatchers(mut self, n: usize) -> Self {
        self.max_dispatchers = n;
        self
    }

    #[must_use]
    pub fn with_workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    #[must_use]
    pub fn with_job_queue_capacity(mut self, n: usize) -> Self {
        self.job_queue_capacity = n;
        self
    }

    #[must_use]
    pub fn with_errors(mut self, enabled: bool) -> Self {
        self.errors_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_error_buffer_size(mut self, n: usize) -> Self {
        self.error_buffer_size = n;
        self
    }

    #[must_use]
    pub fn with_worker_floor(mut self, floor: usize) -> Self {
        self.worker_floor = floor;
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Checks that the configuration can produce a working pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when a dispatcher, worker, queue or
    /// error-buffer count is zero.
    pub fn validate(&self) -> Result<()> {
        let zero = [
            (self.init_dispatchers, "init_dispatchers"),
            (self.workers, "workers"),
            (self.job_queue_capacity, "job_queue_capacity"),
            (self.error_buffer_size, "error_buffer_size"),
        ];
        match zero.iter().find(|(value, _)| *value < 1) {
            Some((_, field)) => Err(Error::InvalidConfig {
                reason: format!("{field} must be greater than 0"),
            }),
            None => Ok(()),
        }
    }

    /// Validates and raises `max_dispatchers` to `init_dispatchers` if it was
    /// configured lower.
    pub(crate) fn normalized(mut self) -> Result<Self> {
        self.validate()?;
        self.max_dispatchers = self.max_dispatchers.max(self.init_dispatchers);
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.init_dispatchers, 1);
        assert_eq!(config.max_dispatchers, 3);
        assert_eq!(config.workers, 20);
        assert_eq!(config.job_queue_capacity, 1000);
        assert!(!config.errors_enabled);
        assert_eq!(config.worker_floor, 1);
    }

    #[test]
    fn rejects_zero_dispatchers_and_workers() {
        let err = Config::default().with_init_dispatchers(0).validate();
        assert!(matches!(err, Err(Error::InvalidConfig { reason }) if reason.contains("init_dispatchers")));

        let err = Config::default().with_workers(0).validate();
        assert!(matches!(err, Err(Error::InvalidConfig { reason }) if reason.contains("workers")));

        assert!(Config::default().with_job_queue_capacity(0).validate().is_err());
    }

    #[test]
    fn max_dispatchers_is_raised_to_initial() {
        let config = Config::default()
            .with_init_dispatchers(5)
            .with_max_dispatchers(2)
            .normalized()
            .unwrap();
        assert_eq!(config.max_dispatchers, 5);
    }
}
