//! Per-provider circuit breakers.
//!
//! A breaker stops calls to a provider for a cooldown after repeated
//! failures. One breaker exists per provider name and is shared by every
//! worker in the process through [`BreakerRegistry`].

use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use strum::{AsRefStr, Display};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected until `next_attempt_at`.
    Open,
    /// A single trial call is in flight.
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding for the state gauge.
    pub fn as_gauge(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Rejected without calling the provider. Not a provider failure.
    #[error("Circuit breaker is open for {provider}")]
    Open { provider: String },

    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    next_attempt_at: Option<Instant>,
    trial_started_at: Option<Instant>,
}

/// Point-in-time view of a breaker, for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    /// Milliseconds until a trial call is allowed; only set while open.
    pub retry_in_ms: Option<u64>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            provider = %name,
            failure_threshold = config.failure_threshold,
            open_timeout_ms = config.open_timeout.as_millis() as u64,
            "Circuit breaker initialized"
        );
        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                next_attempt_at: None,
                trial_started_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Run `operation` if the breaker admits a call, recording its outcome.
    ///
    /// A rejection never runs `operation` and never touches the failure count.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.try_acquire::<E>()?;

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitBreakerError::OperationFailed(e))
            }
        }
    }

    /// Ask permission for one call.
    pub fn try_acquire<E>(&self) -> Result<(), CircuitBreakerError<E>> {
        self.try_acquire_at(Instant::now())
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.failure_count = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.next_attempt_at = None;
            inner.trial_started_at = None;
            info!(provider = %self.name, "Circuit breaker closed (recovered)");
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let now = Instant::now();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            retry_in_ms: match inner.state {
                CircuitState::Open => inner
                    .next_attempt_at
                    .map(|at| at.saturating_duration_since(now).as_millis() as u64),
                _ => None,
            },
        }
    }

    fn try_acquire_at<E>(&self, now: Instant) -> Result<(), CircuitBreakerError<E>> {
        let mut inner = self.lock();
        let state = inner.state;
        match state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let due = inner.next_attempt_at.map_or(true, |at| now >= at);
                if due {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_started_at = Some(now);
                    info!(provider = %self.name, "Circuit breaker half-open (trial call)");
                    Ok(())
                } else {
                    debug!(provider = %self.name, "Circuit breaker open, rejecting call");
                    Err(self.open_error())
                }
            }
            CircuitState::HalfOpen => {
                // The trial's caller may have been dropped without reporting back.
                let abandoned = inner
                    .trial_started_at
                    .map_or(true, |at| now.saturating_duration_since(at) >= self.config.open_timeout);
                if abandoned {
                    warn!(provider = %self.name, "Half-open trial never reported, allowing a new trial");
                    inner.trial_started_at = Some(now);
                    Ok(())
                } else {
                    Err(self.open_error())
                }
            }
        }
    }

    fn record_failure_at(&self, now: Instant) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        let state = inner.state;
        match state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    self.open(&mut inner, now);
                }
            }
            CircuitState::HalfOpen => self.open(&mut inner, now),
            // Late result from a call admitted before the breaker opened.
            CircuitState::Open => {}
        }
    }

    fn open(&self, inner: &mut BreakerInner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.next_attempt_at = Some(now + self.config.open_timeout);
        inner.trial_started_at = None;
        warn!(
            provider = %self.name,
            failure_count = inner.failure_count,
            failure_threshold = self.config.failure_threshold,
            open_timeout_ms = self.config.open_timeout.as_millis() as u64,
            "Circuit breaker opened"
        );
    }

    fn open_error<E>(&self) -> CircuitBreakerError<E> {
        CircuitBreakerError::Open {
            provider: self.name.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // Never held across an await; a poisoned lock still holds a valid state.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Owns exactly one breaker per provider name for the process lifetime.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    /// Snapshots of every breaker, sorted by name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut snapshots: Vec<_> = breakers.values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Publish every breaker's state as a gauge.
    pub fn export_gauges(&self) {
        for snapshot in self.snapshots() {
            metrics::gauge!("triage_breaker_state", "provider" => snapshot.name)
                .set(snapshot.state.as_gauge());
        }
    }
}
