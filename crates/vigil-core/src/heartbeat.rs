//! Per-cycle liveness reporting.

use crate::io::{append_history, ensure_dir, epoch_now};
use crate::status::{history_path, pid_path, write_loop_status};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::{Mutex, MutexGuard, PoisonError};
use vigil_types::{Heartbeat, LoopStatus};

/// Receives one [`Heartbeat`] per finished cycle. Sinks never fail the loop.
pub trait HeartbeatSink: Send + Sync {
    fn loop_started(&self, _loop_name: &str) {}

    fn beat(&self, heartbeat: &Heartbeat);

    fn loop_stopped(&self, _loop_name: &str, _last_error: Option<&str>) {}
}

#[derive(Debug, Default)]
pub struct NoopHeartbeat;

impl HeartbeatSink for NoopHeartbeat {
    fn beat(&self, _heartbeat: &Heartbeat) {}
}

#[derive(Debug, Default)]
pub struct TracingHeartbeat;

impl HeartbeatSink for TracingHeartbeat {
    fn loop_started(&self, loop_name: &str) {
        tracing::info!(loop_name, "loop started");
    }

    fn beat(&self, heartbeat: &Heartbeat) {
        tracing::debug!(
            loop_name = %heartbeat.loop_name,
            cycle = heartbeat.cycle_count,
            status = heartbeat.status.as_str(),
            duration_ms = heartbeat.duration_ms,
            "heartbeat"
        );
    }

    fn loop_stopped(&self, loop_name: &str, last_error: Option<&str>) {
        tracing::info!(loop_name, last_error = last_error.unwrap_or("-"), "loop stopped");
    }
}

#[derive(Debug, Default)]
pub struct MemoryHeartbeat {
    beats: Mutex<Vec<Heartbeat>>,
}

impl MemoryHeartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn beats(&self) -> Vec<Heartbeat> {
        self.beats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl HeartbeatSink for MemoryHeartbeat {
    fn beat(&self, heartbeat: &Heartbeat) {
        self.beats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(heartbeat.clone());
    }
}

/// Keeps `<runtime>/<loop>.status.json` current, holds `<loop>.pid` while
/// the loop runs and appends one line per event to `<loop>.history`.
#[derive(Debug)]
pub struct StatusFileHeartbeat {
    runtime_dir: PathBuf,
    status: Mutex<LoopStatus>,
    pid_file: Mutex<Option<PathBuf>>,
}

impl StatusFileHeartbeat {
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Result<Self> {
        let runtime_dir = runtime_dir.into();
        ensure_dir(&runtime_dir)?;
        Ok(Self {
            runtime_dir,
            status: Mutex::new(LoopStatus::default()),
            pid_file: Mutex::new(None),
        })
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    pub fn status(&self) -> LoopStatus {
        self.lock_status().clone()
    }

    fn lock_status(&self) -> MutexGuard<'_, LoopStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, status: &LoopStatus, history_line: &str) {
        if let Err(err) = write_loop_status(&self.runtime_dir, status) {
            tracing::warn!(loop_name = %status.loop_name, "status write failed: {err:#}");
        }
        let history = history_path(&self.runtime_dir, &status.loop_name);
        if let Err(err) = append_history(&history, &format!("{history_line}\n")) {
            tracing::warn!(loop_name = %status.loop_name, "history append failed: {err:#}");
        }
    }

    fn create_pid_file(&self, loop_name: &str) -> Result<()> {
        let path = pid_path(&self.runtime_dir, loop_name);
        fs::write(&path, process::id().to_string())
            .with_context(|| format!("failed to write {}", path.display()))?;
        *self.pid_file.lock().unwrap_or_else(PoisonError::into_inner) = Some(path);
        Ok(())
    }

    fn remove_pid_file(&self) {
        let taken = self
            .pid_file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(path) = taken {
            let _ = fs::remove_file(path);
        }
    }
}

impl HeartbeatSink for StatusFileHeartbeat {
    fn loop_started(&self, loop_name: &str) {
        if let Err(err) = self.create_pid_file(loop_name) {
            tracing::warn!(loop_name, "pid file write failed: {err:#}");
        }
        let mut status = self.lock_status();
        let now = epoch_now();
        *status = LoopStatus {
            state: "running".to_string(),
            loop_name: loop_name.to_string(),
            started_at_epoch: now,
            last_heartbeat_at_epoch: now,
            updated_at_epoch: now,
            ..LoopStatus::default()
        };
        self.persist(&status, "loop started");
    }

    fn beat(&self, heartbeat: &Heartbeat) {
        let mut status = self.lock_status();
        if status.loop_name.is_empty() {
            status.loop_name = heartbeat.loop_name.clone();
        }
        status.cycle_count = heartbeat.cycle_count;
        status.last_cycle_status = Some(heartbeat.status);
        status.last_cycle_duration_ms = heartbeat.duration_ms;
        status.last_heartbeat_at_epoch = heartbeat.at_epoch;
        status.updated_at_epoch = epoch_now();
        let line = format!(
            "cycle {} {} {}ms",
            heartbeat.cycle_count,
            heartbeat.status.as_str(),
            heartbeat.duration_ms
        );
        self.persist(&status, &line);
    }

    fn loop_stopped(&self, loop_name: &str, last_error: Option<&str>) {
        let mut status = self.lock_status();
        status.loop_name = loop_name.to_string();
        status.state = "stopped".to_string();
        if let Some(err) = last_error {
            status.last_error = Some(err.to_string());
        }
        status.updated_at_epoch = epoch_now();
        self.persist(&status, "loop stopped");
        drop(status);
        self.remove_pid_file();
    }
}

impl Drop for StatusFileHeartbeat {
    fn drop(&mut self) {
        self.remove_pid_file();
    }
}
