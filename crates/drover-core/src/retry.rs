//! Bounded retry budgets for controller-side polling and messaging.
//!
//! Every retry in the control loop is bounded. The factory centralizes the
//! budgets so jobs and actions do not invent their own.

use std::time::Duration;

/// A bounded retry budget: attempts, delay between them, optional warm-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySpec {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
    /// Delay before the first attempt.
    pub initial_delay: Duration,
}

impl RetrySpec {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            initial_delay: Duration::ZERO,
        }
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }
}

/// Produces the retry budgets used by the controller's jobs.
#[derive(Debug, Clone)]
pub struct RetrySpecFactory {
    instance_state_check: RetrySpec,
    instance_stop_check: RetrySpec,
    message_send: RetrySpec,
}

impl Default for RetrySpecFactory {
    fn default() -> Self {
        Self {
            instance_state_check: RetrySpec::new(30, Duration::from_secs(2))
                .with_initial_delay(Duration::from_secs(1)),
            instance_stop_check: RetrySpec::new(15, Duration::from_secs(2)),
            message_send: RetrySpec::new(3, Duration::from_millis(500)),
        }
    }
}

impl RetrySpecFactory {
    /// Budget for polling an instance up to `Healthy` after a start.
    pub fn instance_state_check(&self) -> RetrySpec {
        self.instance_state_check
    }

    /// Budget for polling an instance down to a terminal state after a stop.
    pub fn instance_stop_check(&self) -> RetrySpec {
        self.instance_stop_check
    }

    /// Budget for re-sending a message that failed at the transport.
    pub fn message_send(&self) -> RetrySpec {
        self.message_send
    }

    /// Uniformly tightened budgets for tests.
    pub fn fast() -> Self {
        Self {
            instance_state_check: RetrySpec::new(5, Duration::from_millis(10)),
            instance_stop_check: RetrySpec::new(5, Duration::from_millis(10)),
            message_send: RetrySpec::new(2, Duration::from_millis(5)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_budgets_are_bounded() {
        let factory = RetrySpecFactory::default();
        assert!(factory.instance_state_check().max_attempts > 0);
        assert!(factory.instance_stop_check().max_attempts > 0);
        assert!(factory.message_send().max_attempts > 0);
    }

    #[test]
    fn initial_delay_is_opt_in() {
        let spec = RetrySpec::new(3, Duration::from_secs(1));
        assert_eq!(spec.initial_delay, Duration::ZERO);
        let spec = spec.with_initial_delay(Duration::from_secs(5));
        assert_eq!(spec.initial_delay, Duration::from_secs(5));
    }
}
