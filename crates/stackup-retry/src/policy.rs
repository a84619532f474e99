use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    Fixed,
    Exponential,
    ExponentialWithJitter,
}

impl BackoffStrategy {
    /// `retry` is zero-based: 0 is the delay before the second attempt.
    pub fn delay(self, retry: u32, initial: Duration, max: Duration) -> Duration {
        let delay = match self {
            Self::Fixed => initial,
            Self::Exponential => initial.saturating_mul(2u32.saturating_pow(retry)),
            Self::ExponentialWithJitter => {
                let base = initial.saturating_mul(2u32.saturating_pow(retry));
                let jitter_ceiling = (base.as_millis() as u64 / 4).max(1);
                let jitter = rand::thread_rng().gen_range(0..=jitter_ceiling);
                base.saturating_add(Duration::from_millis(jitter))
            }
        };
        delay.min(max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    pub attempt_timeout: Option<Duration>,
    /// No new attempt starts once this much time has passed since the first.
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::ExponentialWithJitter,
            attempt_timeout: None,
            deadline: None,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: interval,
            max_delay: interval,
            strategy: BackoffStrategy::Fixed,
            attempt_timeout: None,
            deadline: None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        self.strategy
            .delay(retry, self.initial_delay, self.max_delay)
    }
}
