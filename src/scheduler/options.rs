//! Scheduler configuration.

use std::time::Duration;

use thiserror::Error;

/// Errors raised when scheduler options are invalid.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// Concurrency must allow at least one operation.
    #[error("invalid concurrency {value}: must be at least 1")]
    InvalidConcurrency {
        /// The rejected value.
        value: usize,
    },

    /// The interval cap must allow at least one start per window.
    #[error("invalid interval cap {value}: must be at least 1")]
    InvalidIntervalCap {
        /// The rejected value.
        value: usize,
    },
}

/// Options for [`super::Scheduler`].
///
/// # Default Values
///
/// - `concurrency`: unbounded
/// - `interval_cap`: unbounded (rate limiting disabled)
/// - `interval`: zero (rate limiting disabled)
/// - `carryover_concurrency_count`: false
/// - `auto_start`: true
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Maximum operations in flight; `None` is unbounded.
    pub concurrency: Option<usize>,
    /// Maximum starts per interval window; `None` is unbounded.
    pub interval_cap: Option<usize>,
    /// Length of the rate-limiting window.
    pub interval: Duration,
    /// Count operations still running at a window boundary against the next window.
    pub carryover_concurrency_count: bool,
    /// Start admitting immediately; otherwise wait for `start()`.
    pub auto_start: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            concurrency: None,
            interval_cap: None,
            interval: Duration::ZERO,
            carryover_concurrency_count: false,
            auto_start: true,
        }
    }
}

impl SchedulerOptions {
    /// Caps the number of operations in flight.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Allows at most `cap` starts per `interval`.
    #[must_use]
    pub fn with_interval_cap(mut self, cap: usize, interval: Duration) -> Self {
        self.interval_cap = Some(cap);
        self.interval = interval;
        self
    }

    /// Enables or disables carryover of in-flight operations into the next window.
    #[must_use]
    pub fn with_carryover(mut self, carryover: bool) -> Self {
        self.carryover_concurrency_count = carryover;
        self
    }

    /// Controls whether the scheduler admits operations before `start()`.
    #[must_use]
    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] when `concurrency` or `interval_cap` is zero.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if let Some(value @ 0) = self.concurrency {
            return Err(SchedulerError::InvalidConcurrency { value });
        }
        if let Some(value @ 0) = self.interval_cap {
            return Err(SchedulerError::InvalidIntervalCap { value });
        }
        Ok(())
    }

    /// Rate limiting applies only with both a cap and a nonzero window.
    pub(crate) fn is_interval_ignored(&self) -> bool {
        self.interval_cap.is_none() || self.interval.is_zero()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_options_defaults() {
        let options = SchedulerOptions::default();
        assert_eq!(options.concurrency, None);
        assert!(options.auto_start);
        assert!(!options.carryover_concurrency_count);
        assert!(options.is_interval_ignored());
        assert_eq!(options.validate(), Ok(()));
    }

    #[test]
    fn test_scheduler_options_zero_concurrency_rejected() {
        let options = SchedulerOptions::default().with_concurrency(0);
        assert_eq!(
            options.validate(),
            Err(SchedulerError::InvalidConcurrency { value: 0 })
        );
    }

    #[test]
    fn test_scheduler_options_zero_interval_cap_rejected() {
        let options = SchedulerOptions::default().with_interval_cap(0, Duration::from_secs(1));
        let error = options.validate().unwrap_err();
        assert!(error.to_string().contains("interval cap 0"));
    }

    #[test]
    fn test_scheduler_options_zero_interval_ignores_cap() {
        let options = SchedulerOptions::default().with_interval_cap(2, Duration::ZERO);
        assert!(options.is_interval_ignored());

        let options = SchedulerOptions::default().with_interval_cap(2, Duration::from_millis(100));
        assert!(!options.is_interval_ignored());
    }
}
