//! Watchdog and coarse resource accounting around a loop cycle.
//!
//! The watchdog only detects and reports. Interrupting the stuck work is up
//! to the `on_timeout` callback, typically by cancelling a [`CancelToken`]
//! the cycle body polls.

use crate::resources::{ResourceDelta, ResourceSnapshot};
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::Level;
use vigil_config::GuardConfig;

/// Shared cooperative-cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub type TimeoutCallback = Arc<dyn Fn() + Send + Sync>;
pub type ResourceLimitCallback = Box<dyn Fn(u64) + Send>;

/// Callbacks invoked by a [`LoopGuard`].
#[derive(Default)]
pub struct GuardHooks {
    /// Runs on the watchdog thread, at most once per arming.
    pub on_timeout: Option<TimeoutCallback>,
    /// Runs on exit with the resident size that exceeded the limit.
    pub on_resource_limit: Option<ResourceLimitCallback>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardLogEntry {
    pub at: String,
    pub level: Level,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct GuardReport {
    pub name: String,
    pub delta: ResourceDelta,
    pub rss_bytes: Option<u64>,
    pub memory_limit_exceeded: bool,
    pub watchdog_fired: u32,
    pub log: Vec<GuardLogEntry>,
}

enum WatchdogSignal {
    Reset,
    Stop,
}

struct Watchdog {
    tx: mpsc::Sender<WatchdogSignal>,
    handle: JoinHandle<()>,
}

impl Watchdog {
    fn spawn(
        name: &str,
        timeout: Duration,
        fired: Arc<AtomicU32>,
        on_timeout: Option<TimeoutCallback>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<WatchdogSignal>();
        let guard_name = name.to_string();
        let handle = thread::Builder::new()
            .name(format!("watchdog-{name}"))
            .spawn(move || {
                let mut armed = true;
                loop {
                    let signal = if armed {
                        rx.recv_timeout(timeout)
                    } else {
                        rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
                    };
                    match signal {
                        Ok(WatchdogSignal::Reset) => armed = true,
                        Ok(WatchdogSignal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            armed = false;
                            fired.fetch_add(1, Ordering::SeqCst);
                            tracing::error!(
                                guard = %guard_name,
                                timeout_ms = timeout.as_millis() as u64,
                                "watchdog fired; cycle appears hung"
                            );
                            if let Some(callback) = &on_timeout {
                                callback();
                            }
                        }
                    }
                }
            })
            .context("failed to spawn watchdog thread")?;
        Ok(Self { tx, handle })
    }

    fn reset(&self) {
        let _ = self.tx.send(WatchdogSignal::Reset);
    }

    fn stop(self) {
        let _ = self.tx.send(WatchdogSignal::Stop);
        if self.handle.join().is_err() {
            tracing::warn!("watchdog thread panicked");
        }
    }
}

/// Scoped guard: entering starts the watchdog, finishing (or dropping)
/// stops it and checks resource usage.
pub struct LoopGuard {
    name: String,
    memory_limit: Option<u64>,
    max_log_entries: usize,
    log: VecDeque<GuardLogEntry>,
    baseline: ResourceSnapshot,
    watchdog: Option<Watchdog>,
    fired: Arc<AtomicU32>,
    on_resource_limit: Option<ResourceLimitCallback>,
    finished: bool,
}

impl std::fmt::Debug for LoopGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopGuard")
            .field("name", &self.name)
            .field("memory_limit", &self.memory_limit)
            .field("log_entries", &self.log.len())
            .field("watchdog_fired", &self.watchdog_fired())
            .finish()
    }
}

impl LoopGuard {
    pub fn enter(name: &str, config: &GuardConfig) -> Result<Self> {
        Self::enter_with(name, config, GuardHooks::default())
    }

    /// A zero `watchdog_timeout` disables the watchdog.
    pub fn enter_with(name: &str, config: &GuardConfig, hooks: GuardHooks) -> Result<Self> {
        let fired = Arc::new(AtomicU32::new(0));
        let watchdog = if config.watchdog_timeout.is_zero() {
            None
        } else {
            Some(Watchdog::spawn(
                name,
                config.watchdog_timeout,
                fired.clone(),
                hooks.on_timeout,
            )?)
        };
        Ok(Self {
            name: name.to_string(),
            memory_limit: config.memory_limit_bytes,
            max_log_entries: config.max_log_entries.max(1),
            log: VecDeque::new(),
            baseline: ResourceSnapshot::take(),
            watchdog,
            fired,
            on_resource_limit: hooks.on_resource_limit,
            finished: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Prove liveness: restart the watchdog countdown.
    pub fn reset_watchdog(&self) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.reset();
        }
    }

    pub fn watchdog_fired(&self) -> u32 {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn log(&mut self, message: impl Into<String>, level: Level) {
        let message = message.into();
        match level {
            Level::ERROR => tracing::error!(guard = %self.name, "{message}"),
            Level::WARN => tracing::warn!(guard = %self.name, "{message}"),
            Level::INFO => tracing::info!(guard = %self.name, "{message}"),
            Level::DEBUG => tracing::debug!(guard = %self.name, "{message}"),
            _ => tracing::trace!(guard = %self.name, "{message}"),
        }
        self.log.push_back(GuardLogEntry {
            at: Utc::now().to_rfc3339(),
            level,
            message,
        });
        while self.log.len() > self.max_log_entries {
            self.log.pop_front();
        }
    }

    pub fn log_entries(&self) -> impl Iterator<Item = &GuardLogEntry> {
        self.log.iter()
    }

    pub fn finish(mut self) -> GuardReport {
        self.close()
    }

    fn close(&mut self) -> GuardReport {
        self.finished = true;
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.stop();
        }

        let exit = ResourceSnapshot::take();
        let delta = exit.delta_since(&self.baseline);
        let memory_limit_exceeded = match (self.memory_limit, exit.rss_bytes) {
            (Some(limit), Some(rss)) if rss > limit => {
                tracing::warn!(
                    guard = %self.name,
                    rss_bytes = rss,
                    limit_bytes = limit,
                    "memory limit exceeded"
                );
                if let Some(callback) = &self.on_resource_limit {
                    callback(rss);
                }
                true
            }
            _ => false,
        };

        GuardReport {
            name: self.name.clone(),
            delta,
            rss_bytes: exit.rss_bytes,
            memory_limit_exceeded,
            watchdog_fired: self.watchdog_fired(),
            log: self.log.drain(..).collect(),
        }
    }
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.close();
        }
    }
}
