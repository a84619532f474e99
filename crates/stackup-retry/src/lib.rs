mod breaker;
mod error;
mod executor;
mod policy;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use error::{classify_http_status, classify_io_error, AttemptError, ErrorClass, RetryError};
pub use executor::{Attempt, Resilience};
pub use policy::{BackoffStrategy, RetryPolicy};
