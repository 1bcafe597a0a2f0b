//! Per-service circuit breakers.
//!
//! A breaker sits in front of calls to one remote service. After `failure_threshold` failures
//! it opens and refuses calls outright with [`CircuitOpenError`]. Once `timeout` has passed since
//! the last failure, the next call is let through as a trial (half-open); enough trial successes
//! close it again, a single trial failure reopens it.
//!
//! While closed, each success only takes one off the failure count, so a service that keeps
//! failing intermittently still trips the breaker eventually.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::CircuitOpenError;
use crate::observability::{EventSink, FetchEvent, NoopSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are refused without running.
    Open,
    /// Calls pass through as recovery trials.
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    /// Time since the last failure before a trial call is allowed.
    pub timeout: Duration,
    /// Trial successes needed to close.
    pub half_open_retry_count: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            half_open_retry_count: 2,
        }
    }
}

/// Snapshot of a breaker's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerMetrics {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<Instant>,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
}

pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    sink: Arc<dyn EventSink>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_sink(service, config, Arc::new(NoopSink))
    }

    pub fn with_sink(
        service: impl Into<String>,
        config: CircuitBreakerConfig,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        CircuitBreaker {
            service: service.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_at: None,
            }),
            sink,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let state = self.state.lock();
        BreakerMetrics {
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            last_failure_at: state.last_failure_at,
        }
    }

    /// Run `operation` unless the circuit is open.
    ///
    /// The state lock is held only while deciding and while recording the outcome, never while
    /// `operation` runs. If the returned future is dropped before `operation` completes, nothing
    /// is recorded.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        self.acquire()?;

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        result
    }

    /// Force the breaker closed with zeroed counters.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        self.transition(&mut state, CircuitState::Closed);
        state.failure_count = 0;
        state.success_count = 0;
        state.last_failure_at = None;
        tracing::info!("Circuit breaker for '{}' manually reset", self.service);
    }

    fn acquire(&self) -> Result<(), CircuitOpenError> {
        let mut state = self.state.lock();
        if state.state != CircuitState::Open {
            return Ok(());
        }

        let timed_out = state
            .last_failure_at
            .is_none_or(|at| at.elapsed() >= self.config.timeout);
        if !timed_out {
            return Err(CircuitOpenError {
                service: self.service.clone(),
            });
        }

        self.transition(&mut state, CircuitState::HalfOpen);
        state.success_count = 0;
        tracing::info!("Circuit breaker for '{}' entering half-open state", self.service);
        Ok(())
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => {
                state.failure_count = state.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.half_open_retry_count {
                    self.transition(&mut state, CircuitState::Closed);
                    state.failure_count = 0;
                    state.success_count = 0;
                    tracing::info!(
                        "Circuit breaker for '{}' closed after successful recovery",
                        self.service
                    );
                }
            }
            // A call admitted before the circuit opened has succeeded.
            CircuitState::Open => {
                self.transition(&mut state, CircuitState::Closed);
                state.failure_count = 0;
                state.success_count = 0;
            }
        }
    }

    fn record_failure(&self) {
        let mut state = self.state.lock();
        state.last_failure_at = Some(Instant::now());

        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    self.transition(&mut state, CircuitState::Open);
                    tracing::warn!(
                        "Circuit breaker for '{}' opened after {} failures",
                        self.service,
                        state.failure_count
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.transition(&mut state, CircuitState::Open);
                state.failure_count = self.config.failure_threshold;
                tracing::warn!(
                    "Circuit breaker for '{}' reopened after failure in half-open state",
                    self.service
                );
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState) {
        let from = state.state;
        if from == to {
            return;
        }
        state.state = to;
        self.sink.emit(FetchEvent::BreakerTransition {
            service: self.service.clone(),
            from,
            to,
        });
    }
}

/// Breakers keyed by service, created on first use and kept for the registry's lifetime.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    sink: Arc<dyn EventSink>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_sink(config, Arc::new(NoopSink))
    }

    pub fn with_sink(config: CircuitBreakerConfig, sink: Arc<dyn EventSink>) -> Self {
        CircuitBreakerRegistry {
            config,
            breakers: Mutex::new(HashMap::new()),
            sink,
        }
    }

    /// The breaker for `service`, created closed if it does not exist yet.
    pub fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        if let Some(existing) = breakers.get(service) {
            return Arc::clone(existing);
        }
        let breaker = Arc::new(CircuitBreaker::with_sink(
            service,
            self.config,
            Arc::clone(&self.sink),
        ));
        breakers.insert(service.to_string(), Arc::clone(&breaker));
        breaker
    }

    pub async fn execute<T, E, F, Fut>(&self, service: &str, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        self.breaker(service).execute(operation).await
    }

    /// Reset one breaker. Unknown services are ignored.
    pub fn reset(&self, service: &str) {
        let breaker = self.breakers.lock().get(service).cloned();
        if let Some(breaker) = breaker {
            breaker.reset();
        }
    }

    pub fn reset_all(&self) {
        let breakers: Vec<_> = self.breakers.lock().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    pub fn all_metrics(&self) -> HashMap<String, BreakerMetrics> {
        self.breakers
            .lock()
            .iter()
            .map(|(service, breaker)| (service.clone(), breaker.metrics()))
            .collect()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
