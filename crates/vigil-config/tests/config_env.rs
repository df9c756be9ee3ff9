use std::env;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tempfile::tempdir;
use vigil_config::{load_supervisor_config, ConfigOverrides};

static ENV_LOCK: Mutex<()> = Mutex::new(());

const KEYS: [&str; 4] = [
    "VIGIL_FAILURE_THRESHOLD",
    "VIGIL_BACKOFF_FACTOR",
    "VIGIL_RESOURCES",
    "VIGIL_MAX_CYCLES",
];

/// Holds the env lock and clears the variables it set on drop.
struct ScopedEnv {
    _lock: MutexGuard<'static, ()>,
}

impl ScopedEnv {
    fn set(vars: &[(&str, &str)]) -> Self {
        let lock = ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        for key in KEYS {
            env::remove_var(key);
        }
        for (key, value) in vars {
            env::set_var(key, value);
        }
        Self { _lock: lock }
    }
}

impl Drop for ScopedEnv {
    fn drop(&mut self) {
        for key in KEYS {
            env::remove_var(key);
        }
    }
}

fn write_rc(dir: &Path) {
    fs::write(
        dir.join(".vigilrc"),
        r#"
[loop]
max_cycles = 3
resources = ["disk"]

[breaker]
failure_threshold = 9
backoff_factor = 3.0
"#,
    )
    .expect("vigilrc write");
}

#[test]
fn env_beats_file() {
    let dir = tempdir().expect("tempdir");
    write_rc(dir.path());
    let _env = ScopedEnv::set(&[
        ("VIGIL_FAILURE_THRESHOLD", "4"),
        ("VIGIL_BACKOFF_FACTOR", " 1.5 "),
        ("VIGIL_RESOURCES", "network, docs,,"),
    ]);

    let cfg = load_supervisor_config(dir.path(), &ConfigOverrides::default()).expect("config");

    assert_eq!(cfg.breaker.failure_threshold, 4);
    assert_eq!(cfg.breaker.backoff_factor, 1.5);
    assert_eq!(cfg.looping.resources, vec!["network", "docs"]);
    assert_eq!(cfg.looping.max_cycles, Some(3));
}

#[test]
fn env_beats_defaults_without_file() {
    let dir = tempdir().expect("tempdir");
    let _env = ScopedEnv::set(&[("VIGIL_FAILURE_THRESHOLD", "2"), ("VIGIL_MAX_CYCLES", "8")]);

    let cfg = load_supervisor_config(dir.path(), &ConfigOverrides::default()).expect("config");

    assert_eq!(cfg.breaker.failure_threshold, 2);
    assert_eq!(cfg.looping.max_cycles, Some(8));
    assert_eq!(cfg.breaker.backoff_factor, 2.0);
    assert_eq!(cfg.breaker.reset_timeout, Duration::from_secs(60));
}

#[test]
fn overrides_beat_env() {
    let dir = tempdir().expect("tempdir");
    write_rc(dir.path());
    let _env = ScopedEnv::set(&[
        ("VIGIL_FAILURE_THRESHOLD", "4"),
        ("VIGIL_RESOURCES", "network"),
        ("VIGIL_MAX_CYCLES", "8"),
    ]);

    let cfg = load_supervisor_config(
        dir.path(),
        &ConfigOverrides {
            failure_threshold: Some(1),
            resources: Some(vec!["gpu".to_string()]),
            max_cycles: Some(20),
            ..ConfigOverrides::default()
        },
    )
    .expect("config");

    assert_eq!(cfg.breaker.failure_threshold, 1);
    assert_eq!(cfg.looping.resources, vec!["gpu"]);
    assert_eq!(cfg.looping.max_cycles, Some(20));
}

#[test]
fn unparsable_env_values_fall_through_to_file() {
    let dir = tempdir().expect("tempdir");
    write_rc(dir.path());
    let _env = ScopedEnv::set(&[
        ("VIGIL_FAILURE_THRESHOLD", "many"),
        ("VIGIL_BACKOFF_FACTOR", "fast"),
        ("VIGIL_RESOURCES", " , "),
    ]);

    let cfg = load_supervisor_config(dir.path(), &ConfigOverrides::default()).expect("config");

    assert_eq!(cfg.breaker.failure_threshold, 9);
    assert_eq!(cfg.breaker.backoff_factor, 3.0);
    assert_eq!(cfg.looping.resources, vec!["disk"]);
}

#[test]
fn unparsable_env_values_fall_through_to_defaults() {
    let dir = tempdir().expect("tempdir");
    let _env = ScopedEnv::set(&[
        ("VIGIL_FAILURE_THRESHOLD", "-3"),
        ("VIGIL_BACKOFF_FACTOR", ""),
    ]);

    let cfg = load_supervisor_config(dir.path(), &ConfigOverrides::default()).expect("config");

    assert_eq!(cfg.breaker.failure_threshold, 5);
    assert_eq!(cfg.breaker.backoff_factor, 2.0);
    assert!(cfg.looping.resources.is_empty());
}
