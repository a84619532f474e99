use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub threshold: u32,
    pub window: Duration,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<Instant>,
    pub cooldown_deadline: Option<Instant>,
}

/// Three-state breaker for one named resource.
///
/// Transitions: closed -> open once `threshold` consecutive failures land
/// inside `window`; open -> half_open when the cooldown deadline passes;
/// half_open admits a single trial call whose outcome closes or reopens it.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    consecutive_failures: u32,
    streak_started_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    cooldown_deadline: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            streak_started_at: None,
            last_failure_at: None,
            cooldown_deadline: None,
            trial_in_flight: false,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            last_failure_at: self.last_failure_at,
            cooldown_deadline: self.cooldown_deadline,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Asks permission for one call. `Err` carries the time left until the
    /// breaker would admit a trial call.
    pub fn try_acquire_at(&mut self, now: Instant) -> Result<(), Duration> {
        match self.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let deadline = self.cooldown_deadline.unwrap_or(now);
                if now >= deadline {
                    self.state = BreakerState::HalfOpen;
                    self.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(deadline - now)
                }
            }
            BreakerState::HalfOpen => {
                if self.trial_in_flight {
                    Err(self.config.cooldown)
                } else {
                    self.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success_at(&mut self, _now: Instant) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.streak_started_at = None;
        self.cooldown_deadline = None;
        self.trial_in_flight = false;
    }

    pub fn record_failure_at(&mut self, now: Instant) {
        self.last_failure_at = Some(now);
        match self.state {
            BreakerState::HalfOpen => {
                self.trial_in_flight = false;
                self.trip(now);
            }
            BreakerState::Open => {}
            BreakerState::Closed => {
                let streak_expired = self
                    .streak_started_at
                    .map(|started| now.saturating_duration_since(started) > self.config.window)
                    .unwrap_or(true);
                if streak_expired {
                    self.streak_started_at = Some(now);
                    self.consecutive_failures = 0;
                }
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.threshold {
                    self.trip(now);
                }
            }
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.cooldown_deadline = Some(now + self.config.cooldown);
    }
}

/// Breakers keyed by resource name, created on first use.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<BTreeMap<String, CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn try_acquire(&self, resource: &str) -> Result<(), Duration> {
        self.try_acquire_at(resource, Instant::now())
    }

    pub fn try_acquire_at(&self, resource: &str, now: Instant) -> Result<(), Duration> {
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(resource.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config));
        let before = breaker.state();
        let result = breaker.try_acquire_at(now);
        if before == BreakerState::Open && breaker.state() == BreakerState::HalfOpen {
            info!(resource, "circuit half-open, admitting trial call");
        }
        result
    }

    pub fn record_success(&self, resource: &str) {
        let mut breakers = self.breakers.lock();
        if let Some(breaker) = breakers.get_mut(resource) {
            let before = breaker.state();
            breaker.record_success_at(Instant::now());
            if before != BreakerState::Closed {
                info!(resource, "circuit closed after successful trial");
            }
        }
    }

    pub fn record_failure(&self, resource: &str) {
        self.record_failure_at(resource, Instant::now());
    }

    pub fn record_failure_at(&self, resource: &str, now: Instant) {
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(resource.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config));
        let before = breaker.state();
        breaker.record_failure_at(now);
        if before != BreakerState::Open && breaker.state() == BreakerState::Open {
            warn!(
                resource,
                failures = breaker.snapshot().consecutive_failures,
                cooldown_secs = self.config.cooldown.as_secs_f64(),
                "circuit opened"
            );
        }
    }

    pub fn snapshot(&self, resource: &str) -> Option<BreakerSnapshot> {
        self.breakers.lock().get(resource).map(CircuitBreaker::snapshot)
    }
}
