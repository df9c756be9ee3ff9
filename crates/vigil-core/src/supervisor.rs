//! The supervised loop: runs implementor-supplied cycles under a watchdog,
//! recovers from cycle errors and falls back to degraded mode when recovery
//! fails.

use crate::actions::{ActionContext, ActionRegistry};
use crate::circuit_breaker::{BreakerRegistry, CircuitBreaker};
use crate::classifier::classify;
use crate::degraded::DegradedSession;
use crate::error::SupervisorError;
use crate::error_log::{forget_logged, take_logged, ErrorLogger};
use crate::guard::{CancelToken, GuardHooks, LoopGuard};
use crate::heartbeat::{HeartbeatSink, NoopHeartbeat, StatusFileHeartbeat};
use crate::io::epoch_now;
use crate::recovery::{RecoveryRegistry, CONSECUTIVE_FAILURES};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::Level;
use vigil_config::{DegradedConfig, SupervisorConfig};
use vigil_types::{CycleStatus, DegradedSummary, ErrorContext, Heartbeat};

const CYCLE_HISTORY_LEN: usize = 100;

/// Shared services a loop depends on. Several loops in one process share
/// the breaker and action registries by cloning the `Arc`s.
#[derive(Clone)]
pub struct SupervisorServices {
    pub breakers: Arc<BreakerRegistry>,
    pub actions: Arc<ActionRegistry>,
    pub recovery: Arc<RecoveryRegistry>,
    pub errors: ErrorLogger,
    pub heartbeat: Arc<dyn HeartbeatSink>,
}

impl std::fmt::Debug for SupervisorServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorServices")
            .field("breakers", &self.breakers.len())
            .field("actions", &self.actions.len())
            .field("recovery", &self.recovery)
            .field("errors", &self.errors)
            .finish()
    }
}

impl SupervisorServices {
    /// Fresh registries, default recovery strategies, tracing error sink and
    /// no-op heartbeat.
    pub fn new(config: &SupervisorConfig) -> Self {
        let errors = ErrorLogger::default();
        Self {
            breakers: Arc::new(BreakerRegistry::new(config.breaker.clone(), errors.clone())),
            actions: Arc::new(ActionRegistry::new()),
            recovery: Arc::new(RecoveryRegistry::with_defaults()),
            errors,
            heartbeat: Arc::new(NoopHeartbeat),
        }
    }

    /// Default services with a [`StatusFileHeartbeat`] under
    /// `config.looping.runtime_dir`.
    pub fn with_status_files(config: &SupervisorConfig) -> Result<Self> {
        let heartbeat = StatusFileHeartbeat::new(&config.looping.runtime_dir)?;
        Ok(Self::new(config).with_heartbeat(Arc::new(heartbeat)))
    }

    pub fn with_heartbeat(mut self, heartbeat: Arc<dyn HeartbeatSink>) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_actions(mut self, actions: Arc<ActionRegistry>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_recovery(mut self, recovery: Arc<RecoveryRegistry>) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_breakers(mut self, breakers: Arc<BreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn with_error_logger(mut self, errors: ErrorLogger) -> Self {
        self.errors = errors;
        self
    }
}

/// Divergence reported by [`LoopHooks::detect_behavioral_drift`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drift {
    pub description: String,
    pub details: BTreeMap<String, String>,
}

impl Drift {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// The work a supervised loop performs. Only `process_operations` is
/// required.
pub trait LoopHooks {
    fn begin_cycle(&mut self, _ctx: &mut CycleContext<'_>) -> Result<()> {
        Ok(())
    }

    fn init_cycle_resources(&mut self, _ctx: &mut CycleContext<'_>) -> Result<()> {
        Ok(())
    }

    fn process_operations(&mut self, ctx: &mut CycleContext<'_>) -> Result<()>;

    fn end_cycle(&mut self, _ctx: &mut CycleContext<'_>) -> Result<()> {
        Ok(())
    }

    fn persist_state(&mut self, _ctx: &mut CycleContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Runs after every cycle, failed or not.
    fn release_cycle_resources(&mut self, _ctx: &mut CycleContext<'_>) -> Result<()> {
        Ok(())
    }

    fn validate_cycle_outcomes(&mut self, ctx: &CycleContext<'_>) {
        if ctx.actions().is_empty() {
            tracing::warn!(
                loop_name = ctx.loop_name(),
                cycle = ctx.cycle(),
                "cycle registered no actions"
            );
        }
    }

    fn detect_behavioral_drift(&mut self, _ctx: &CycleContext<'_>) -> Option<Drift> {
        None
    }

    fn correct_drift(&mut self, _drift: &Drift, _ctx: &mut CycleContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Local recovery. The default consults the shared recovery registry.
    fn recover_from_error(&mut self, error: &anyhow::Error, ctx: &mut CycleContext<'_>) -> bool {
        ctx.services()
            .recovery
            .recover(error, &ctx.error_context())
            .recovered
    }

    /// Resources still usable for degraded work after `error`. The default
    /// removes whatever the recovery registry marks as impaired.
    fn available_recovery_resources(
        &self,
        error: &anyhow::Error,
        ctx: &CycleContext<'_>,
    ) -> Vec<String> {
        let error_type = classify(error, &ctx.error_context());
        ctx.services()
            .recovery
            .usable_resources(error_type, ctx.declared_resources())
    }

    fn on_resource_limit(&mut self, _rss_bytes: u64) {}
}

/// Cooperative stop flag shared with other threads.
#[derive(Debug, Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
}

impl StopHandle {
    fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Takes effect at the next cycle boundary.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }
}

/// Everything a hook may touch during one cycle.
pub struct CycleContext<'a> {
    loop_name: &'a str,
    cycle: u64,
    started: Instant,
    consecutive_failures: u32,
    declared_resources: &'a [String],
    state: &'a mut Map<String, Value>,
    temp: &'a mut Map<String, Value>,
    actions: &'a mut Vec<String>,
    cancel: CancelToken,
    guard: &'a mut LoopGuard,
    services: &'a SupervisorServices,
    stop: &'a StopHandle,
}

impl CycleContext<'_> {
    pub fn loop_name(&self) -> &str {
        self.loop_name
    }

    /// 1-based index of the running cycle.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn declared_resources(&self) -> &[String] {
        self.declared_resources
    }

    pub fn services(&self) -> &SupervisorServices {
        self.services
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.services.breakers
    }

    /// Breaker for `operation`, created with the default config on first use.
    pub fn breaker(&self, operation: &str) -> Arc<CircuitBreaker> {
        self.services.breakers.guard(operation, None)
    }

    pub fn get_state<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        get_typed(self.state, key)
    }

    pub fn set_state<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        set_typed(self.state, key, value)
    }

    pub fn get_temp<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        get_typed(self.temp, key)
    }

    pub fn set_temp<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        set_typed(self.temp, key, value)
    }

    /// Note that the cycle did something; see
    /// [`LoopHooks::validate_cycle_outcomes`].
    pub fn record_action(&mut self, action: impl Into<String>) {
        self.actions.push(action.into());
    }

    pub fn actions(&self) -> &[String] {
        self.actions
    }

    /// Cancelled by the watchdog when this cycle overruns its timeout.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// `Err(WatchdogTimeout)` once the watchdog has cancelled this cycle.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SupervisorError::WatchdogTimeout {
                elapsed: self.elapsed(),
            }
            .into());
        }
        Ok(())
    }

    pub fn reset_watchdog(&self) {
        self.guard.reset_watchdog();
    }

    pub fn log(&mut self, message: impl Into<String>, level: Level) {
        self.guard.log(message, level);
    }

    pub fn request_stop(&self) {
        self.stop.stop();
    }

    pub fn error_context(&self) -> ErrorContext {
        let mut ctx = ErrorContext::new();
        ctx.insert("loop".to_string(), self.loop_name.to_string());
        ctx.insert("cycle".to_string(), self.cycle.to_string());
        ctx.insert(
            CONSECUTIVE_FAILURES.to_string(),
            self.consecutive_failures.to_string(),
        );
        ctx
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Stopped,
    MaxCyclesReached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub reason: ExitReason,
    pub cycles_executed: u64,
    /// Failed cycles that a recovery strategy handled.
    pub handled_failures: u64,
    pub degraded_sessions: u64,
}

pub struct SupervisedLoop<H: LoopHooks> {
    name: String,
    hooks: H,
    config: SupervisorConfig,
    services: SupervisorServices,
    stop: StopHandle,
    cycle_count: u64,
    persistent_state: Map<String, Value>,
    temp_state: Map<String, Value>,
    cycle_actions: Vec<String>,
    cycle_durations: VecDeque<Duration>,
    consecutive_failures: u32,
    handled_failures: u64,
    degraded_sessions: u64,
    last_degraded: Option<DegradedSummary>,
    last_error: Option<String>,
}

impl<H: LoopHooks> SupervisedLoop<H> {
    pub fn new(
        name: impl Into<String>,
        hooks: H,
        config: SupervisorConfig,
        services: SupervisorServices,
    ) -> Self {
        Self {
            name: name.into(),
            hooks,
            config,
            services,
            stop: StopHandle::new(),
            cycle_count: 0,
            persistent_state: Map::new(),
            temp_state: Map::new(),
            cycle_actions: Vec::new(),
            cycle_durations: VecDeque::with_capacity(CYCLE_HISTORY_LEN),
            consecutive_failures: 0,
            handled_failures: 0,
            degraded_sessions: 0,
            last_degraded: None,
            last_error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    pub fn into_hooks(self) -> H {
        self.hooks
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    pub fn is_running(&self) -> bool {
        self.stop.is_running()
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn get_state<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        get_typed(&self.persistent_state, key)
    }

    pub fn set_state<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        set_typed(&mut self.persistent_state, key, value)
    }

    pub fn last_degraded_summary(&self) -> Option<&DegradedSummary> {
        self.last_degraded.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Mean duration of the last 100 cycles.
    pub fn average_cycle_duration(&self) -> Option<Duration> {
        if self.cycle_durations.is_empty() {
            return None;
        }
        let total: Duration = self.cycle_durations.iter().sum();
        Some(total / self.cycle_durations.len() as u32)
    }

    /// Run cycles until stopped or `max_cycles` is reached. Cycle errors
    /// never end the loop; only guard setup failures are returned.
    pub fn run(&mut self) -> Result<LoopOutcome> {
        self.config.validate()?;
        self.stop.start();
        self.services.heartbeat.loop_started(&self.name);
        tracing::info!(loop_name = %self.name, "supervised loop starting");

        let result = self.run_cycles();

        self.stop.stop();
        self.services
            .heartbeat
            .loop_stopped(&self.name, self.last_error.as_deref());
        let reason = result?;
        tracing::info!(
            loop_name = %self.name,
            cycles = self.cycle_count,
            ?reason,
            "supervised loop finished"
        );
        Ok(LoopOutcome {
            reason,
            cycles_executed: self.cycle_count,
            handled_failures: self.handled_failures,
            degraded_sessions: self.degraded_sessions,
        })
    }

    fn run_cycles(&mut self) -> Result<ExitReason> {
        loop {
            if !self.stop.is_running() {
                return Ok(ExitReason::Stopped);
            }
            if let Some(max) = self.config.looping.max_cycles {
                if self.cycle_count >= max {
                    return Ok(ExitReason::MaxCyclesReached);
                }
            }

            self.run_cycle()?;

            let delay = self.config.looping.cycle_delay;
            if !delay.is_zero() && self.stop.is_running() {
                thread::sleep(delay);
            }
        }
    }

    fn run_cycle(&mut self) -> Result<()> {
        let cycle = self.cycle_count + 1;
        let started = Instant::now();
        let cancel = CancelToken::new();
        let on_timeout = cancel.clone();
        let mut guard = LoopGuard::enter_with(
            &self.name,
            &self.config.guard,
            GuardHooks {
                on_timeout: Some(Arc::new(move || on_timeout.cancel())),
                on_resource_limit: None,
            },
        )
        .with_context(|| format!("failed to guard cycle {cycle} of '{}'", self.name))?;

        self.temp_state.clear();
        self.cycle_actions.clear();
        forget_logged();

        let mut ctx = CycleContext {
            loop_name: &self.name,
            cycle,
            started,
            consecutive_failures: self.consecutive_failures,
            declared_resources: &self.config.looping.resources,
            state: &mut self.persistent_state,
            temp: &mut self.temp_state,
            actions: &mut self.cycle_actions,
            cancel,
            guard: &mut guard,
            services: &self.services,
            stop: &self.stop,
        };

        let outcome = execute_cycle_steps(&mut self.hooks, &mut ctx);
        if let Err(err) = self.hooks.release_cycle_resources(&mut ctx) {
            tracing::warn!(loop_name = %self.name, cycle, "releasing cycle resources failed: {err:#}");
        }

        let status = match outcome {
            Ok(()) => {
                self.hooks.validate_cycle_outcomes(&ctx);
                self.consecutive_failures = 0;

                let interval = self.config.looping.drift_check_interval;
                if interval > 0 && cycle % interval == 0 {
                    if let Some(drift) = self.hooks.detect_behavioral_drift(&ctx) {
                        tracing::warn!(
                            loop_name = %self.name,
                            cycle,
                            drift = %drift.description,
                            "behavioral drift detected"
                        );
                        if let Err(err) = self.hooks.correct_drift(&drift, &mut ctx) {
                            self.services.errors.log(
                                &err,
                                None,
                                Some("correct_drift"),
                                &ctx.error_context(),
                            );
                        }
                    }
                }
                CycleStatus::Healthy
            }
            Err(err) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.last_error = Some(format!("{err:#}"));
                // Guarded calls record their own failures.
                if !take_logged(&err) {
                    self.services
                        .errors
                        .log(&err, None, Some(self.name.as_str()), &ctx.error_context());
                }

                if self.hooks.recover_from_error(&err, &mut ctx) {
                    tracing::info!(loop_name = %self.name, cycle, "cycle error recovered");
                    self.handled_failures += 1;
                    CycleStatus::Recovered
                } else {
                    let resources = self.hooks.available_recovery_resources(&err, &ctx);
                    let summary = run_degraded_session(
                        &mut ctx,
                        &self.config.degraded,
                        format!("{err:#}"),
                        resources,
                    );
                    self.degraded_sessions += 1;
                    self.last_degraded = Some(summary);
                    CycleStatus::Degraded
                }
            }
        };

        ctx.reset_watchdog();
        drop(ctx);
        let report = guard.finish();
        if report.memory_limit_exceeded {
            if let Some(rss) = report.rss_bytes {
                self.hooks.on_resource_limit(rss);
            }
        }

        self.cycle_count = cycle;
        let duration = started.elapsed();
        if self.cycle_durations.len() == CYCLE_HISTORY_LEN {
            self.cycle_durations.pop_front();
        }
        self.cycle_durations.push_back(duration);

        self.services.heartbeat.beat(&Heartbeat {
            loop_name: self.name.clone(),
            cycle_count: cycle,
            status,
            duration_ms: duration.as_millis() as u64,
            at_epoch: epoch_now(),
        });
        Ok(())
    }
}

fn execute_cycle_steps<H: LoopHooks>(hooks: &mut H, ctx: &mut CycleContext<'_>) -> Result<()> {
    hooks.begin_cycle(ctx)?;
    hooks.init_cycle_resources(ctx)?;
    hooks.process_operations(ctx)?;
    hooks.end_cycle(ctx)?;
    hooks.persist_state(ctx)
}

/// Drive one degraded session to completion, always taking the first
/// suggested action.
fn run_degraded_session(
    ctx: &mut CycleContext<'_>,
    config: &DegradedConfig,
    reason: String,
    resources: Vec<String>,
) -> DegradedSummary {
    let mut action_ctx = ActionContext::new(reason.clone(), resources.clone());
    action_ctx
        .values
        .insert("loop".to_string(), ctx.loop_name().to_string());
    action_ctx
        .values
        .insert("cycle".to_string(), ctx.cycle().to_string());

    let mut session =
        DegradedSession::enter(reason, resources, ctx.services().actions.clone(), config);
    while session.should_continue() && ctx.stop.is_running() {
        let Some(action) = session.get_alternative_actions().into_iter().next() else {
            break;
        };
        let success = action.execute(&action_ctx);
        session.record_action_attempt(&action, success);
        ctx.reset_watchdog();
    }
    session.exit()
}

fn get_typed<T: DeserializeOwned>(map: &Map<String, Value>, key: &str) -> Option<T> {
    map.get(key)
        .and_then(|value| serde_json::from_value(value.clone()).ok())
}

fn set_typed<T: Serialize>(map: &mut Map<String, Value>, key: &str, value: &T) -> Result<()> {
    let value = serde_json::to_value(value)
        .with_context(|| format!("failed to serialize state '{key}'"))?;
    map.insert(key.to_string(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::AlternativeAction;
    use crate::error::OperationError;
    use crate::heartbeat::MemoryHeartbeat;
    use vigil_types::ActionCategory;

    fn config(max_cycles: u64) -> SupervisorConfig {
        let mut config = SupervisorConfig::default();
        config.looping.max_cycles = Some(max_cycles);
        config.looping.drift_check_interval = 2;
        config.guard.watchdog_timeout = Duration::from_secs(5);
        config
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        fail_on: Option<u64>,
        recover: bool,
        drift_checks: u32,
    }

    impl LoopHooks for Recorder {
        fn begin_cycle(&mut self, ctx: &mut CycleContext<'_>) -> Result<()> {
            self.calls.push(format!("begin {}", ctx.cycle()));
            Ok(())
        }

        fn process_operations(&mut self, ctx: &mut CycleContext<'_>) -> Result<()> {
            self.calls.push(format!("process {}", ctx.cycle()));
            ctx.record_action("work");
            if self.fail_on == Some(ctx.cycle()) {
                return Err(OperationError::new("ValueError", "bad cycle").into());
            }
            let seen: u64 = ctx.get_state("seen").unwrap_or(0);
            ctx.set_state("seen", &(seen + 1))
        }

        fn end_cycle(&mut self, ctx: &mut CycleContext<'_>) -> Result<()> {
            self.calls.push(format!("end {}", ctx.cycle()));
            Ok(())
        }

        fn release_cycle_resources(&mut self, ctx: &mut CycleContext<'_>) -> Result<()> {
            self.calls.push(format!("release {}", ctx.cycle()));
            Ok(())
        }

        fn detect_behavioral_drift(&mut self, _ctx: &CycleContext<'_>) -> Option<Drift> {
            self.drift_checks += 1;
            None
        }

        fn recover_from_error(&mut self, _error: &anyhow::Error, _ctx: &mut CycleContext<'_>) -> bool {
            self.recover
        }
    }

    #[test]
    fn cycles_run_hooks_in_order() {
        let cfg = config(2);
        let services = SupervisorServices::new(&cfg);
        let mut lp = SupervisedLoop::new("ordered", Recorder::default(), cfg, services);

        let outcome = lp.run().expect("run");

        assert_eq!(outcome.reason, ExitReason::MaxCyclesReached);
        assert_eq!(
            lp.hooks().calls,
            vec![
                "begin 1", "process 1", "end 1", "release 1", "begin 2", "process 2", "end 2",
                "release 2",
            ]
        );
        assert_eq!(lp.get_state::<u64>("seen"), Some(2));
        assert_eq!(lp.hooks().drift_checks, 1);
        assert!(!lp.is_running());
    }

    #[test]
    fn recovered_failure_skips_degraded_mode() {
        let cfg = config(2);
        let services = SupervisorServices::new(&cfg);
        let hooks = Recorder {
            fail_on: Some(1),
            recover: true,
            ..Recorder::default()
        };
        let mut lp = SupervisedLoop::new("recovering", hooks, cfg, services);

        let outcome = lp.run().expect("run");

        assert_eq!(outcome.handled_failures, 1);
        assert_eq!(outcome.degraded_sessions, 0);
        assert!(!lp.hooks().calls.contains(&"end 1".to_string()));
        assert!(lp.hooks().calls.contains(&"release 1".to_string()));
        assert_eq!(lp.last_error(), Some("ValueError: bad cycle"));
    }

    #[test]
    fn unrecovered_failure_runs_fallback_actions() {
        let cfg = config(1);
        let actions = Arc::new(ActionRegistry::new());
        actions
            .register(AlternativeAction::new("doc", ActionCategory::Documentation, |ctx| {
                Ok(ctx.reason.contains("bad cycle"))
            }))
            .expect("register");
        let services = SupervisorServices::new(&cfg).with_actions(actions.clone());
        let hooks = Recorder {
            fail_on: Some(1),
            ..Recorder::default()
        };
        let mut lp = SupervisedLoop::new("degrading", hooks, cfg, services);

        let outcome = lp.run().expect("run");

        assert_eq!(outcome.degraded_sessions, 1);
        let summary = lp.last_degraded_summary().expect("summary");
        assert_eq!(summary.attempts, 1);
        assert_eq!(summary.successes, 1);
        assert_eq!(actions.get("doc").expect("doc").last_success(), Some(true));
    }

    #[test]
    fn request_stop_from_inside_cycle() {
        struct StopAtTwo;
        impl LoopHooks for StopAtTwo {
            fn process_operations(&mut self, ctx: &mut CycleContext<'_>) -> Result<()> {
                ctx.record_action("tick");
                if ctx.cycle() == 2 {
                    ctx.request_stop();
                }
                Ok(())
            }
        }

        let mut cfg = config(10);
        cfg.looping.max_cycles = None;
        let services = SupervisorServices::new(&cfg);
        let mut lp = SupervisedLoop::new("stopper", StopAtTwo, cfg, services);

        let outcome = lp.run().expect("run");

        assert_eq!(outcome.reason, ExitReason::Stopped);
        assert_eq!(outcome.cycles_executed, 2);
    }

    #[test]
    fn heartbeat_reports_each_cycle() {
        let cfg = config(3);
        let beats = Arc::new(MemoryHeartbeat::new());
        let services = SupervisorServices::new(&cfg).with_heartbeat(beats.clone());
        let hooks = Recorder {
            fail_on: Some(2),
            recover: true,
            ..Recorder::default()
        };
        let mut lp = SupervisedLoop::new("beating", hooks, cfg, services);

        lp.run().expect("run");

        let statuses: Vec<CycleStatus> = beats.beats().iter().map(|b| b.status).collect();
        assert_eq!(
            statuses,
            vec![
                CycleStatus::Healthy,
                CycleStatus::Recovered,
                CycleStatus::Healthy
            ]
        );
        assert!(lp.average_cycle_duration().is_some());
    }

    #[test]
    fn temp_state_is_cleared_between_cycles() {
        struct Temp {
            seen: Vec<Option<u32>>,
        }
        impl LoopHooks for Temp {
            fn process_operations(&mut self, ctx: &mut CycleContext<'_>) -> Result<()> {
                self.seen.push(ctx.get_temp("scratch"));
                ctx.set_temp("scratch", &7u32)?;
                ctx.record_action("scratch");
                Ok(())
            }
        }

        let cfg = config(2);
        let services = SupervisorServices::new(&cfg);
        let mut lp = SupervisedLoop::new("temp", Temp { seen: vec![] }, cfg, services);

        lp.run().expect("run");

        assert_eq!(lp.hooks().seen, vec![None, None]);
    }

    #[test]
    fn typed_state_round_trips_and_rejects_wrong_type() {
        let cfg = config(1);
        let services = SupervisorServices::new(&cfg);
        let mut lp = SupervisedLoop::new("state", Recorder::default(), cfg, services);

        lp.set_state("name", &"alpha").expect("set");

        assert_eq!(lp.get_state::<String>("name").as_deref(), Some("alpha"));
        assert_eq!(lp.get_state::<u64>("name"), None);
        assert_eq!(lp.get_state::<u64>("missing"), None);
    }

    #[test]
    fn invalid_config_is_rejected_before_running() {
        let mut cfg = config(1);
        cfg.breaker.failure_threshold = 0;
        let services = SupervisorServices::new(&cfg);
        let mut lp = SupervisedLoop::new("invalid", Recorder::default(), cfg, services);

        assert!(lp.run().is_err());
        assert!(lp.hooks().calls.is_empty());
    }
}
