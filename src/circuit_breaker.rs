//! Per-client circuit breaker.
//!
//! A three-state gate that stops sending requests to a backend after
//! `max_failures` consecutive failures, then lets trial requests through once
//! `reset_timeout` has passed since the last failure.
//!
//! ```text
//! Closed   --failures >= max_failures-->  Open
//! Open     --reset_timeout elapsed, on allow()-->  HalfOpen
//! HalfOpen --success-->  Closed
//! HalfOpen --failure-->  Open
//! ```
//!
//! All state lives behind one mutex, so [`CircuitBreaker::allow`],
//! [`CircuitBreaker::record_success`] and [`CircuitBreaker::record_failure`]
//! are linearizable. Half-open does not limit how many trial requests pass.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// States of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; requests pass.
    Closed,
    /// Failing fast; requests are refused.
    Open,
    /// Trial requests pass to probe for recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        };
        f.write_str(name)
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub max_failures: u32,
    /// Time after the last failure before a trial request is let through.
    #[serde(with = "crate::serde_millis")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Sets the consecutive failures that open the circuit.
    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    /// Sets how long the circuit stays open before a probe is allowed.
    pub fn with_reset_timeout(mut self, reset_timeout: Duration) -> Self {
        self.reset_timeout = reset_timeout;
        self
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

/// Circuit breaker shared by every call a client makes.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    /// A closed breaker with no recorded failures.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` if a request may be attempted.
    ///
    /// In the open state this is also where the transition to half-open
    /// happens: the first call after `reset_timeout` moves the breaker to
    /// half-open and returns `true`.
    pub fn allow(&self) -> bool {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled_down = inner
                    .last_failure
                    .map_or(true, |at| at.elapsed() >= self.config.reset_timeout);
                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    tracing::info!(
                        failures = inner.failure_count,
                        "Circuit breaker half-open - letting trial requests through"
                    );
                }
                cooled_down
            }
        }
    }

    /// Records a successful request: clears the failure count and closes the
    /// circuit.
    pub fn record_success(&self) {
        let mut inner = self.lock();

        if inner.state != CircuitState::Closed {
            tracing::info!(from = %inner.state, "Circuit breaker closed");
        }
        inner.failure_count = 0;
        inner.state = CircuitState::Closed;
    }

    /// Records a failed request, opening the circuit once the failure
    /// threshold is reached.
    pub fn record_failure(&self) {
        let mut inner = self.lock();

        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        if inner.failure_count >= self.config.max_failures && inner.state != CircuitState::Open {
            tracing::warn!(
                failures = inner.failure_count,
                max_failures = self.config.max_failures,
                reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                from = %inner.state,
                "Circuit breaker opened"
            );
            inner.state = CircuitState::Open;
        }
    }

    /// The current state.
    ///
    /// Does not perform the open to half-open transition; see [`Self::allow`].
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Consecutive failures recorded since the last success.
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// The configuration this breaker was built with.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Runs `operation` behind the breaker, recording its result.
    ///
    /// Returns [`Error::CircuitOpen`] without polling `operation` when the
    /// breaker refuses. Cancellation is not counted as a failure.
    pub async fn call<T, Fut>(&self, operation: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        if !self.allow() {
            return Err(Error::CircuitOpen);
        }

        let result = operation.await;
        match &result {
            Ok(_) => self.record_success(),
            Err(Error::Cancelled | Error::DeadlineExceeded) => {}
            Err(_) => self.record_failure(),
        }
        result
    }
}
