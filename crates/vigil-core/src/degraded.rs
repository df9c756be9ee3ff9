//! Degraded-operation sessions: one bounded episode of fallback work.
//!
//! The session picks and orders actions; the caller runs them and reports
//! back through [`DegradedSession::record_action_attempt`].

use crate::actions::{ActionRegistry, AlternativeAction};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use vigil_config::DegradedConfig;
use vigil_types::{ActionCategory, DegradedSummary};

#[derive(Debug)]
pub struct DegradedSession {
    reason: String,
    available_resources: Vec<String>,
    registry: Arc<ActionRegistry>,
    started: Instant,
    max_duration: Duration,
    attempted: HashSet<String>,
    successful: HashSet<String>,
    attempts: u32,
    successes: u32,
    failures: u32,
    categories: Vec<ActionCategory>,
    finished: bool,
}

impl DegradedSession {
    pub fn enter(
        reason: impl Into<String>,
        available_resources: Vec<String>,
        registry: Arc<ActionRegistry>,
        config: &DegradedConfig,
    ) -> Self {
        let reason = reason.into();
        tracing::warn!(
            reason = %reason,
            resources = ?available_resources,
            "entering degraded mode"
        );
        Self {
            reason,
            available_resources,
            registry,
            started: Instant::now(),
            max_duration: config.max_degraded_time,
            attempted: HashSet::new(),
            successful: HashSet::new(),
            attempts: 0,
            successes: 0,
            failures: 0,
            categories: Vec::new(),
            finished: false,
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn available_resources(&self) -> &[String] {
        &self.available_resources
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn was_attempted(&self, name: &str) -> bool {
        self.attempted.contains(name)
    }

    pub fn was_successful(&self, name: &str) -> bool {
        self.successful.contains(name)
    }

    /// Executable actions, unattempted first, then by category priority,
    /// then by fewest required resources. Ties keep registration order.
    pub fn get_alternative_actions(&self) -> Vec<Arc<AlternativeAction>> {
        let mut actions = self.executable();
        actions.sort_by_key(|a| {
            (
                self.attempted.contains(a.name()),
                a.category().priority(),
                a.required_resources().len(),
            )
        });
        actions
    }

    pub fn record_action_attempt(&mut self, action: &AlternativeAction, success: bool) {
        self.attempts += 1;
        self.attempted.insert(action.name().to_string());
        if success {
            self.successes += 1;
            self.successful.insert(action.name().to_string());
        } else {
            self.failures += 1;
        }
        if !self.categories.contains(&action.category()) {
            self.categories.push(action.category());
        }
        tracing::debug!(
            action = action.name(),
            category = %action.category(),
            success,
            "degraded action attempted"
        );
    }

    /// False once the time budget is spent or every executable action has
    /// been tried.
    pub fn should_continue(&self) -> bool {
        if self.elapsed() > self.max_duration {
            return false;
        }
        self.executable()
            .iter()
            .any(|a| !self.attempted.contains(a.name()))
    }

    pub fn summary(&self) -> DegradedSummary {
        DegradedSummary {
            reason: self.reason.clone(),
            duration_ms: self.elapsed().as_millis() as u64,
            attempts: self.attempts,
            successes: self.successes,
            failures: self.failures,
            categories: self.categories.clone(),
        }
    }

    /// Leave degraded mode, logging the summary.
    pub fn exit(mut self) -> DegradedSummary {
        self.finished = true;
        let summary = self.summary();
        log_exit(&summary);
        summary
    }

    fn executable(&self) -> Vec<Arc<AlternativeAction>> {
        self.registry
            .all()
            .into_iter()
            .filter(|a| a.can_execute(&self.available_resources))
            .collect()
    }
}

impl Drop for DegradedSession {
    fn drop(&mut self) {
        if !self.finished {
            log_exit(&self.summary());
        }
    }
}

fn log_exit(summary: &DegradedSummary) {
    tracing::warn!(
        reason = %summary.reason,
        duration_ms = summary.duration_ms,
        attempts = summary.attempts,
        successes = summary.successes,
        failures = summary.failures,
        "leaving degraded mode"
    );
}
