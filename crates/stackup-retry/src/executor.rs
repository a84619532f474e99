use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::{AttemptError, BreakerConfig, BreakerRegistry, RetryError, RetryPolicy};

/// Context handed to each attempt. The operation owns its own I/O and is
/// expected to honour `timeout` (for example as an HTTP client timeout).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub number: u32,
    pub timeout: Option<Duration>,
}

/// Retry policy composed with a per-resource circuit breaker.
///
/// The breaker is consulted before every attempt; an open circuit ends the
/// sequence immediately without invoking the operation.
#[derive(Debug, Default)]
pub struct Resilience {
    breakers: BreakerRegistry,
}

impl Resilience {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: BreakerRegistry::new(config),
        }
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn execute<T, F>(
        &self,
        resource: &str,
        policy: &RetryPolicy,
        mut operation: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut(&Attempt) -> Result<T, AttemptError>,
    {
        self.execute_with_sleep(resource, policy, &mut operation, thread::sleep)
    }

    fn execute_with_sleep<T, F, S>(
        &self,
        resource: &str,
        policy: &RetryPolicy,
        operation: &mut F,
        mut sleep: S,
    ) -> Result<T, RetryError>
    where
        F: FnMut(&Attempt) -> Result<T, AttemptError>,
        S: FnMut(Duration),
    {
        let started = Instant::now();
        let max_attempts = policy.max_attempts.max(1);
        let mut number = 0;

        loop {
            number += 1;
            if let Err(retry_after) = self.breakers.try_acquire(resource) {
                debug!(resource, attempt = number, "circuit open, skipping attempt");
                return Err(RetryError::CircuitOpen {
                    resource: resource.to_string(),
                    retry_after,
                });
            }

            let attempt = Attempt {
                number,
                timeout: policy.attempt_timeout,
            };
            let err = match operation(&attempt) {
                Ok(value) => {
                    self.breakers.record_success(resource);
                    return Ok(value);
                }
                Err(err) => err,
            };

            match err {
                AttemptError::Permanent(error) => {
                    // The resource answered; only the request was bad.
                    self.breakers.record_success(resource);
                    return Err(RetryError::Permanent {
                        resource: resource.to_string(),
                        error,
                    });
                }
                AttemptError::Transient(error) => {
                    self.breakers.record_failure(resource);
                    let out_of_time = policy
                        .deadline
                        .is_some_and(|deadline| started.elapsed() >= deadline);
                    if number >= max_attempts || out_of_time {
                        warn!(
                            resource,
                            attempts = number,
                            error = %format!("{error:#}"),
                            "retries exhausted"
                        );
                        return Err(RetryError::Exhausted {
                            resource: resource.to_string(),
                            attempts: number,
                            error,
                        });
                    }

                    let mut delay = policy.delay_before_retry(number - 1);
                    if let Some(deadline) = policy.deadline {
                        delay = delay.min(deadline.saturating_sub(started.elapsed()));
                    }
                    warn!(
                        resource,
                        attempt = number,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %format!("{error:#}"),
                        "transient failure, retrying"
                    );
                    sleep(delay);
                }
            }
        }
    }
}
