//! Per-operation circuit breakers and the registry that owns them.
//!
//! ```text
//! CLOSED    --failure_count >= threshold-->        OPEN
//! OPEN      --elapsed >= current_timeout, on call--> HALF_OPEN
//! HALF_OPEN --successes >= half_open_max_calls-->  CLOSED
//! HALF_OPEN --any failure, timeout grown-->        OPEN
//! ```
//!
//! The timeout only grows on half-open failures; the first open period
//! always uses `reset_timeout`.

use crate::classifier::classify;
use crate::error::SupervisorError;
use crate::error_log::{mark_logged, ErrorLogger};
use crate::io::{epoch_now, write_json};
use anyhow::Result;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use vigil_config::BreakerConfig;
use vigil_types::{BreakerStatus, CircuitState, ErrorContext, ErrorType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerAction {
    Continue,
    OpenCircuit,
    CloseCircuit,
}

/// Why a call was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Still cooling off; the next probe is allowed after this long.
    Open { retry_after: Duration },
    /// Every half-open probe slot is taken.
    HalfOpenSaturated,
}

/// Admitted call. `probe` identifies the half-open generation whose slot the
/// call occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    probe: Option<u64>,
}

/// The lock-free breaker state machine. Time is passed in explicitly.
#[derive(Debug, Clone)]
pub struct BreakerCore {
    pub config: BreakerConfig,
    pub state: CircuitState,
    pub failure_count: u32,
    pub successful_calls: u32,
    pub half_open_calls: u32,
    pub current_timeout: Duration,
    pub last_failure: Option<Instant>,
    pub last_failure_at_epoch: Option<u64>,
    pub last_error_type: Option<ErrorType>,
    generation: u64,
}

impl BreakerCore {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            current_timeout: config.reset_timeout,
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            successful_calls: 0,
            half_open_calls: 0,
            last_failure: None,
            last_failure_at_epoch: None,
            last_error_type: None,
            generation: 0,
        }
    }

    pub fn admit(&mut self, now: Instant) -> Result<Admission, Rejection> {
        match self.state {
            CircuitState::Closed => Ok(Admission { probe: None }),
            CircuitState::Open => {
                let elapsed = self
                    .last_failure
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(self.current_timeout);
                if elapsed < self.current_timeout {
                    return Err(Rejection::Open {
                        retry_after: self.current_timeout - elapsed,
                    });
                }
                self.state = CircuitState::HalfOpen;
                self.generation += 1;
                self.successful_calls = 0;
                self.half_open_calls = 1;
                Ok(Admission {
                    probe: Some(self.generation),
                })
            }
            CircuitState::HalfOpen => {
                if self.half_open_calls >= self.config.half_open_max_calls {
                    return Err(Rejection::HalfOpenSaturated);
                }
                self.half_open_calls += 1;
                Ok(Admission {
                    probe: Some(self.generation),
                })
            }
        }
    }

    /// Free the half-open slot held by `admission`, if it is still current.
    pub fn release(&mut self, admission: Admission) {
        if admission.probe == Some(self.generation) && self.state == CircuitState::HalfOpen {
            self.half_open_calls = self.half_open_calls.saturating_sub(1);
        }
    }

    /// Whether an outcome from `admission` still belongs to the current
    /// episode. Probes from an earlier half-open round, and calls admitted
    /// while closed that finish during a half-open round, are not counted.
    pub fn is_current(&self, admission: Admission) -> bool {
        match admission.probe {
            Some(generation) => {
                generation == self.generation && self.state != CircuitState::Closed
            }
            None => self.state != CircuitState::HalfOpen,
        }
    }

    pub fn record_success(&mut self) -> CircuitBreakerAction {
        match self.state {
            CircuitState::HalfOpen => {
                self.successful_calls += 1;
                if self.successful_calls >= self.config.half_open_max_calls {
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.successful_calls = 0;
                    self.half_open_calls = 0;
                    self.current_timeout = self.config.reset_timeout;
                    CircuitBreakerAction::CloseCircuit
                } else {
                    CircuitBreakerAction::Continue
                }
            }
            CircuitState::Closed => {
                self.failure_count = self.failure_count.saturating_sub(1);
                CircuitBreakerAction::Continue
            }
            CircuitState::Open => CircuitBreakerAction::Continue,
        }
    }

    pub fn record_failure(
        &mut self,
        error_type: Option<ErrorType>,
        now: Instant,
    ) -> CircuitBreakerAction {
        self.last_failure = Some(now);
        self.last_failure_at_epoch = Some(epoch_now());
        self.last_error_type = error_type;

        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.half_open_calls = 0;
                self.successful_calls = 0;
                self.current_timeout = self.grown_timeout();
                CircuitBreakerAction::OpenCircuit
            }
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    self.state = CircuitState::Open;
                    CircuitBreakerAction::OpenCircuit
                } else {
                    CircuitBreakerAction::Continue
                }
            }
            CircuitState::Open => {
                self.failure_count += 1;
                CircuitBreakerAction::Continue
            }
        }
    }

    fn grown_timeout(&self) -> Duration {
        let max = self.config.max_backoff;
        let grown = self.current_timeout.as_nanos() as f64 * self.config.backoff_factor;
        if !grown.is_finite() || grown >= max.as_nanos() as f64 {
            max
        } else {
            Duration::from_nanos(grown as u64).max(self.config.reset_timeout)
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, CircuitState::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, CircuitState::Closed)
    }

    pub fn is_half_open(&self) -> bool {
        matches!(self.state, CircuitState::HalfOpen)
    }
}

/// Thread-safe breaker guarding one named operation.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    core: Mutex<BreakerCore>,
    logger: ErrorLogger,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, logger: ErrorLogger) -> Self {
        Self {
            name: name.into(),
            core: Mutex::new(BreakerCore::new(config)),
            logger,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn current_timeout(&self) -> Duration {
        self.lock().current_timeout
    }

    pub fn status(&self) -> BreakerStatus {
        let core = self.lock();
        BreakerStatus {
            name: self.name.clone(),
            state: core.state,
            failure_count: core.failure_count,
            successful_calls: core.successful_calls,
            half_open_calls: core.half_open_calls,
            last_failure_at_epoch: core.last_failure_at_epoch,
            current_timeout_ms: core.current_timeout.as_millis() as u64,
        }
    }

    /// Ask to run the guarded operation. A rejection comes back as
    /// [`SupervisorError::CircuitOpen`] inside the `anyhow::Error`.
    pub fn enter(&self) -> Result<BreakerPermit<'_>> {
        let (before, admitted) = {
            let mut core = self.lock();
            let before = core.state;
            (before, core.admit(Instant::now()))
        };
        match admitted {
            Ok(admission) => {
                if before == CircuitState::Open {
                    tracing::info!(operation = %self.name, "circuit half-open; probing");
                }
                Ok(BreakerPermit {
                    breaker: self,
                    admission,
                    resolved: false,
                })
            }
            Err(rejection) => {
                let retry_after = match rejection {
                    Rejection::Open { retry_after } => retry_after,
                    Rejection::HalfOpenSaturated => Duration::ZERO,
                };
                tracing::debug!(operation = %self.name, ?rejection, "call rejected");
                Err(SupervisorError::CircuitOpen {
                    operation: self.name.clone(),
                    retry_after,
                }
                .into())
            }
        }
    }

    pub fn record_success(&self) -> CircuitBreakerAction {
        let action = self.lock().record_success();
        self.trace_success(action);
        action
    }

    pub fn record_failure(&self, error_type: Option<ErrorType>) -> CircuitBreakerAction {
        let (action, failures, timeout) = {
            let mut core = self.lock();
            let action = core.record_failure(error_type, Instant::now());
            (action, core.failure_count, core.current_timeout)
        };
        self.trace_failure(action, failures, timeout, error_type);
        action
    }

    fn trace_success(&self, action: CircuitBreakerAction) {
        if action == CircuitBreakerAction::CloseCircuit {
            tracing::info!(operation = %self.name, "circuit closed");
        }
    }

    fn trace_failure(
        &self,
        action: CircuitBreakerAction,
        failures: u32,
        timeout: Duration,
        error_type: Option<ErrorType>,
    ) {
        if action == CircuitBreakerAction::OpenCircuit {
            tracing::warn!(
                operation = %self.name,
                failures,
                timeout_ms = timeout.as_millis() as u64,
                error_type = error_type.map(ErrorType::as_str).unwrap_or("-"),
                "circuit opened"
            );
        }
    }

    /// Run `op` under the breaker. Errors from `op` are classified, logged,
    /// counted and returned unchanged.
    pub fn call<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let permit = self.enter()?;
        match op() {
            Ok(value) => {
                permit.succeed();
                Ok(value)
            }
            Err(err) => {
                permit.fail(&err);
                Err(err)
            }
        }
    }

    /// Like [`call`](Self::call), but a rejected call runs `fallback`
    /// instead of failing.
    pub fn call_with_fallback<T, F, G>(&self, op: F, fallback: G) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
        G: FnOnce(&SupervisorError) -> Result<T>,
    {
        match self.enter() {
            Ok(permit) => match op() {
                Ok(value) => {
                    permit.succeed();
                    Ok(value)
                }
                Err(err) => {
                    permit.fail(&err);
                    Err(err)
                }
            },
            Err(err) => match err.downcast_ref::<SupervisorError>() {
                Some(rejection) => fallback(rejection),
                None => Err(err),
            },
        }
    }

    /// Release the slot held by `admission` and count a success, unless the
    /// admission is stale.
    fn settle_success(&self, admission: Admission) {
        let action = {
            let mut core = self.lock();
            core.release(admission);
            core.is_current(admission).then(|| core.record_success())
        };
        match action {
            Some(action) => self.trace_success(action),
            None => tracing::debug!(operation = %self.name, "stale success ignored"),
        }
    }

    fn settle_failure(&self, admission: Admission, error_type: ErrorType) {
        let settled = {
            let mut core = self.lock();
            core.release(admission);
            core.is_current(admission).then(|| {
                let action = core.record_failure(Some(error_type), Instant::now());
                (action, core.failure_count, core.current_timeout)
            })
        };
        match settled {
            Some((action, failures, timeout)) => {
                self.trace_failure(action, failures, timeout, Some(error_type))
            }
            None => tracing::debug!(operation = %self.name, "stale failure ignored"),
        }
    }
}

/// Scoped admission to a breaker. Exactly one outcome is recorded per
/// permit; dropping it unresolved counts as an unknown failure.
#[must_use = "resolve the permit with succeed() or fail()"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    resolved: bool,
}

impl BreakerPermit<'_> {
    pub fn succeed(mut self) {
        self.resolved = true;
        self.breaker.settle_success(self.admission);
    }

    pub fn fail(self, error: &anyhow::Error) -> ErrorType {
        self.fail_with_context(error, &ErrorContext::new())
    }

    /// Classify `error` under `context`, log it and count the failure.
    pub fn fail_with_context(mut self, error: &anyhow::Error, context: &ErrorContext) -> ErrorType {
        self.resolved = true;
        let error_type = classify(error, context);
        self.breaker
            .logger
            .log(error, Some(error_type), Some(&self.breaker.name), context);
        mark_logged(error);
        self.breaker.settle_failure(self.admission, error_type);
        error_type
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        tracing::warn!(operation = %self.breaker.name, "guarded call abandoned");
        self.breaker
            .settle_failure(self.admission, ErrorType::Unknown);
    }
}

/// Process-wide set of breakers keyed by operation name.
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    default_config: BreakerConfig,
    logger: ErrorLogger,
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig, logger: ErrorLogger) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            default_config,
            logger,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Existing breaker for `name`, or a new one built from `config` (the
    /// registry default when `None`).
    pub fn guard(&self, name: &str, config: Option<&BreakerConfig>) -> Arc<CircuitBreaker> {
        let mut breakers = self.lock();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    name,
                    config.unwrap_or(&self.default_config).clone(),
                    self.logger.clone(),
                ))
            })
            .clone()
    }

    /// Create a fresh breaker, replacing any existing one with that name.
    pub fn register(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(name, config, self.logger.clone()));
        self.lock().insert(name.to_string(), breaker.clone());
        breaker
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Status of every breaker, sorted by name.
    pub fn snapshot(&self) -> Vec<BreakerStatus> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        let mut statuses: Vec<BreakerStatus> = breakers.iter().map(|b| b.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }
}

pub fn write_breaker_snapshot(path: &Path, registry: &BreakerRegistry) -> Result<()> {
    write_json(path, &registry.snapshot())
}
