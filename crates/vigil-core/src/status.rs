use crate::io::{epoch_now, write_json};
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use vigil_types::LoopStatus;

pub const STALE_STATE: &str = "stale";

pub fn status_path(runtime_dir: &Path, loop_name: &str) -> PathBuf {
    runtime_dir.join(format!("{loop_name}.status.json"))
}

pub fn pid_path(runtime_dir: &Path, loop_name: &str) -> PathBuf {
    runtime_dir.join(format!("{loop_name}.pid"))
}

pub fn history_path(runtime_dir: &Path, loop_name: &str) -> PathBuf {
    runtime_dir.join(format!("{loop_name}.history"))
}

pub fn write_loop_status(runtime_dir: &Path, status: &LoopStatus) -> Result<()> {
    write_json(&status_path(runtime_dir, &status.loop_name), status)
}

/// Read a loop's status file. A `running` status whose owning process is
/// gone is rewritten as `stale`.
pub fn read_loop_status(runtime_dir: &Path, loop_name: &str) -> Result<LoopStatus> {
    let path = status_path(runtime_dir, loop_name);
    if !path.exists() {
        bail!("status file not found at {}", path.display());
    }
    let body =
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut status: LoopStatus = serde_json::from_str(&body)
        .with_context(|| format!("invalid json in {}", path.display()))?;
    if is_stale_running_status(runtime_dir, &status) {
        status.state = STALE_STATE.to_string();
        status.last_heartbeat_at_epoch = 0;
        if status.last_error.is_none() {
            status.last_error = Some("loop process not found".to_string());
        }
        status.updated_at_epoch = epoch_now();
        let _ = write_json(&path, &status);
        let _ = fs::remove_file(pid_path(runtime_dir, loop_name));
    }
    Ok(status)
}

fn is_stale_running_status(runtime_dir: &Path, status: &LoopStatus) -> bool {
    if status.state != "running" {
        return false;
    }
    let Ok(raw_pid) = fs::read_to_string(pid_path(runtime_dir, &status.loop_name)) else {
        return true;
    };
    let Ok(pid) = raw_pid.trim().parse::<i32>() else {
        return true;
    };
    if pid <= 0 {
        return true;
    }
    !is_pid_alive(pid)
}

#[cfg(unix)]
fn is_pid_alive(pid: i32) -> bool {
    unsafe {
        let rc = libc::kill(pid, 0);
        if rc == 0 {
            true
        } else {
            // EPERM: exists, owned by someone else.
            std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
        }
    }
}

#[cfg(not(unix))]
fn is_pid_alive(_pid: i32) -> bool {
    true
}
