//! Per-error-type recovery strategies and resource impairment tracking.

use crate::classifier::classify;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use vigil_types::{ErrorContext, ErrorType};

/// Context key carrying how many cycles in a row have failed.
pub const CONSECUTIVE_FAILURES: &str = "consecutive_failures";

pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &str;
    fn can_recover(&self, error: &anyhow::Error, context: &ErrorContext) -> bool;
    fn attempt_recovery(&self, error: &anyhow::Error, context: &ErrorContext) -> bool;
}

/// Waits out a short pause and reports the failure as recovered, until the
/// failure has repeated `max_consecutive` times.
#[derive(Debug, Clone)]
pub struct RetryAfterDelay {
    pub delay: Duration,
    pub max_consecutive: u32,
}

impl Default for RetryAfterDelay {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(500),
            max_consecutive: 3,
        }
    }
}

impl RecoveryStrategy for RetryAfterDelay {
    fn name(&self) -> &str {
        "retry_after_delay"
    }

    fn can_recover(&self, _error: &anyhow::Error, context: &ErrorContext) -> bool {
        let failures = context
            .get(CONSECUTIVE_FAILURES)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        failures < self.max_consecutive
    }

    fn attempt_recovery(&self, _error: &anyhow::Error, _context: &ErrorContext) -> bool {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOutcome {
    pub error_type: ErrorType,
    /// Strategy that was consulted, if any was registered for the type.
    pub strategy: Option<String>,
    pub recovered: bool,
}

#[derive(Default, Clone)]
pub struct RecoveryRegistry {
    strategies: HashMap<ErrorType, Arc<dyn RecoveryStrategy>>,
    impairments: HashMap<ErrorType, Vec<String>>,
}

impl std::fmt::Debug for RecoveryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.strategies.keys().copied().collect();
        types.sort();
        f.debug_struct("RecoveryRegistry")
            .field("strategies", &types)
            .field("impairments", &self.impairments)
            .finish()
    }
}

impl RecoveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retry transient, timeout and connectivity failures; connectivity
    /// failures take the `network` resource out of use.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let retry: Arc<dyn RecoveryStrategy> = Arc::new(RetryAfterDelay::default());
        for error_type in [
            ErrorType::Transient,
            ErrorType::Timeout,
            ErrorType::Connectivity,
        ] {
            registry.register(error_type, retry.clone());
        }
        registry.impair(ErrorType::Connectivity, ["network"]);
        registry
    }

    /// Replaces any strategy already registered for `error_type`.
    pub fn register(&mut self, error_type: ErrorType, strategy: Arc<dyn RecoveryStrategy>) {
        self.strategies.insert(error_type, strategy);
    }

    pub fn strategy_for(&self, error_type: ErrorType) -> Option<&Arc<dyn RecoveryStrategy>> {
        self.strategies.get(&error_type)
    }

    /// Classify `error` and run the matching strategy. A missing strategy, or
    /// one that declines via `can_recover`, means no recovery.
    pub fn recover(&self, error: &anyhow::Error, context: &ErrorContext) -> RecoveryOutcome {
        let error_type = classify(error, context);
        let Some(strategy) = self.strategies.get(&error_type) else {
            return RecoveryOutcome {
                error_type,
                strategy: None,
                recovered: false,
            };
        };

        let recovered =
            strategy.can_recover(error, context) && strategy.attempt_recovery(error, context);
        tracing::debug!(
            error_type = %error_type,
            strategy = strategy.name(),
            recovered,
            "recovery attempted"
        );
        RecoveryOutcome {
            error_type,
            strategy: Some(strategy.name().to_string()),
            recovered,
        }
    }

    /// Mark `resources` as unusable after a failure of `error_type`.
    pub fn impair<I, S>(&mut self, error_type: ErrorType, resources: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry = self.impairments.entry(error_type).or_default();
        for resource in resources {
            let resource = resource.into();
            if !entry.contains(&resource) {
                entry.push(resource);
            }
        }
    }

    /// `declared` minus whatever a failure of `error_type` impairs.
    pub fn usable_resources(&self, error_type: ErrorType, declared: &[String]) -> Vec<String> {
        let impaired = self.impairments.get(&error_type);
        declared
            .iter()
            .filter(|r| impaired.map_or(true, |list| !list.contains(r)))
            .cloned()
            .collect()
    }
}
