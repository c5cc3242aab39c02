use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// The possible states of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed and calls reach the collector
    Closed,
    /// Circuit is open and calls are rejected without being sent
    Open,
    /// Circuit lets a limited number of calls through to test recovery
    HalfOpen,
}

/// Configuration for the circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures that will trip the circuit
    pub failure_threshold: usize,
    /// Time to wait before transitioning from Open to HalfOpen
    pub reset_timeout: Duration,
    /// Maximum number of calls allowed in HalfOpen state
    pub half_open_allowed_calls: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_allowed_calls: 1,
        }
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Stops calling a collector that keeps failing until it had time to recover
pub struct CircuitBreaker {
    state: Arc<RwLock<CircuitState>>,
    failures: Arc<AtomicUsize>,
    successes: Arc<AtomicUsize>,
    /// Calls admitted since the circuit went half-open
    half_open_calls: Arc<AtomicUsize>,
    last_failure_time: Arc<AtomicU64>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(CircuitState::Closed)),
            failures: Arc::new(AtomicUsize::new(0)),
            successes: Arc::new(AtomicUsize::new(0)),
            half_open_calls: Arc::new(AtomicUsize::new(0)),
            last_failure_time: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    /// Check if a call is allowed to proceed
    pub async fn allow_request(&self) -> bool {
        let state = *self.state.read().await;

        match state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let last_failure = self.last_failure_time.load(Ordering::SeqCst);
                let elapsed = now_millis().saturating_sub(last_failure);

                if elapsed < self.config.reset_timeout.as_millis() as u64 {
                    log::debug!("Collector circuit open, rejecting call");
                    return false;
                }

                let mut state = self.state.write().await;
                match *state {
                    CircuitState::Open => {
                        log::info!("Collector circuit half-open after {elapsed} ms");
                        *state = CircuitState::HalfOpen;
                        self.successes.store(0, Ordering::SeqCst);
                        self.half_open_calls.store(1, Ordering::SeqCst);
                        true
                    }
                    CircuitState::HalfOpen => self.admit_half_open_call(),
                    CircuitState::Closed => true,
                }
            }
            CircuitState::HalfOpen => self.admit_half_open_call(),
        }
    }

    fn admit_half_open_call(&self) -> bool {
        let limit = self.config.half_open_allowed_calls;
        let admitted = self
            .half_open_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .is_ok();
        if !admitted {
            log::debug!("Collector circuit half-open, {limit} trial calls already admitted");
        }
        admitted
    }

    /// Record a successful call
    pub async fn record_success(&self) {
        let state = *self.state.read().await;

        match state {
            CircuitState::Closed => {
                self.failures.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                let success_count = self.successes.fetch_add(1, Ordering::SeqCst) + 1;
                if success_count >= self.config.half_open_allowed_calls {
                    log::info!("Collector recovered, closing circuit");
                    *self.state.write().await = CircuitState::Closed;
                    self.failures.store(0, Ordering::SeqCst);
                    self.successes.store(0, Ordering::SeqCst);
                    self.half_open_calls.store(0, Ordering::SeqCst);
                }
            }
            CircuitState::Open => {
                // a call admitted before the circuit opened came back fine
                *self.state.write().await = CircuitState::HalfOpen;
                self.successes.store(1, Ordering::SeqCst);
                self.half_open_calls.store(1, Ordering::SeqCst);
            }
        }
    }

    /// Record a failed call
    pub async fn record_failure(&self) {
        let state = *self.state.read().await;
        self.last_failure_time.store(now_millis(), Ordering::SeqCst);

        match state {
            CircuitState::Closed => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    log::warn!("{failures} consecutive collector failures, opening circuit");
                    *self.state.write().await = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                log::warn!("Collector still failing, reopening circuit");
                *self.state.write().await = CircuitState::Open;
                self.successes.store(0, Ordering::SeqCst);
                self.half_open_calls.store(0, Ordering::SeqCst);
            }
            CircuitState::Open => {}
        }
    }

    /// Get the current state of the circuit breaker
    pub async fn get_state(&self) -> CircuitState {
        *self.state.read().await
    }
}
