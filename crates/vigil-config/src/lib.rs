use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = ".vigilrc";

/// Thresholds and timing for one circuit breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_max_calls: u32,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(600),
        }
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            bail!("failure_threshold must be greater than 0");
        }
        if self.half_open_max_calls == 0 {
            bail!("half_open_max_calls must be greater than 0");
        }
        if self.backoff_factor.is_nan() || self.backoff_factor < 1.0 {
            bail!("backoff_factor must be at least 1.0");
        }
        if self.max_backoff < self.reset_timeout {
            bail!("max_backoff must not be shorter than reset_timeout");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    /// `None` runs until stopped.
    pub max_cycles: Option<u64>,
    /// Run drift detection every N completed cycles; 0 disables it.
    pub drift_check_interval: u64,
    /// Pause between cycles.
    pub cycle_delay: Duration,
    /// Resource names the loop declares as usable by fallback actions.
    pub resources: Vec<String>,
    pub runtime_dir: PathBuf,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_cycles: None,
            drift_check_interval: 10,
            cycle_delay: Duration::ZERO,
            resources: Vec::new(),
            runtime_dir: PathBuf::from(".vigil"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegradedConfig {
    pub max_degraded_time: Duration,
}

impl Default for DegradedConfig {
    fn default() -> Self {
        Self {
            max_degraded_time: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardConfig {
    pub watchdog_timeout: Duration,
    pub memory_limit_bytes: Option<u64>,
    pub max_log_entries: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout: Duration::from_secs(300),
            memory_limit_bytes: None,
            max_log_entries: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SupervisorConfig {
    pub looping: LoopConfig,
    pub breaker: BreakerConfig,
    pub degraded: DegradedConfig,
    pub guard: GuardConfig,
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<()> {
        self.breaker.validate()?;
        if self.guard.watchdog_timeout.is_zero() {
            bail!("watchdog_timeout must be greater than 0");
        }
        if self.guard.max_log_entries == 0 {
            bail!("max_log_entries must be greater than 0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub max_cycles: Option<u64>,
    pub watchdog_timeout_secs: Option<u64>,
    pub failure_threshold: Option<u32>,
    pub reset_timeout_secs: Option<u64>,
    pub max_degraded_secs: Option<u64>,
    pub resources: Option<Vec<String>>,
    pub runtime_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct Vigilrc {
    #[serde(default, rename = "loop")]
    looping: LoopSection,
    #[serde(default)]
    breaker: BreakerSection,
    #[serde(default)]
    degraded: DegradedSection,
    #[serde(default)]
    guard: GuardSection,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct LoopSection {
    max_cycles: Option<u64>,
    drift_check_interval: Option<u64>,
    cycle_delay_ms: Option<u64>,
    resources: Option<Vec<String>>,
    runtime_dir: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct BreakerSection {
    failure_threshold: Option<u32>,
    reset_timeout_secs: Option<u64>,
    half_open_max_calls: Option<u32>,
    backoff_factor: Option<f64>,
    max_backoff_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DegradedSection {
    max_degraded_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct GuardSection {
    watchdog_timeout_secs: Option<u64>,
    memory_limit_mb: Option<u64>,
    max_log_entries: Option<usize>,
}

/// Resolve the supervisor configuration for `cwd`.
///
/// Each field takes the first value found in: `overrides`, `VIGIL_*`
/// environment variables, `<cwd>/.vigilrc`, built-in defaults.
pub fn load_supervisor_config(cwd: &Path, overrides: &ConfigOverrides) -> Result<SupervisorConfig> {
    let mut file_cfg = Vigilrc::default();
    let rc_path = cwd.join(CONFIG_FILE_NAME);
    if rc_path.exists() {
        let raw = fs::read_to_string(&rc_path)
            .with_context(|| format!("failed to read {}", rc_path.display()))?;
        file_cfg = toml::from_str(&raw)
            .with_context(|| format!("failed to parse {}", rc_path.display()))?;
    }

    let defaults = SupervisorConfig::default();

    let max_cycles = first_some(
        overrides.max_cycles,
        env_u64("VIGIL_MAX_CYCLES"),
        file_cfg.looping.max_cycles,
    )
    .or(defaults.looping.max_cycles);

    let drift_check_interval = first_some(
        None,
        env_u64("VIGIL_DRIFT_CHECK_INTERVAL"),
        file_cfg.looping.drift_check_interval,
    )
    .unwrap_or(defaults.looping.drift_check_interval);

    let cycle_delay = first_some(
        None,
        env_u64("VIGIL_CYCLE_DELAY_MS"),
        file_cfg.looping.cycle_delay_ms,
    )
    .map(Duration::from_millis)
    .unwrap_or(defaults.looping.cycle_delay);

    let resources = first_some(
        overrides.resources.clone(),
        env_csv("VIGIL_RESOURCES"),
        file_cfg.looping.resources,
    )
    .unwrap_or_default();

    let runtime_dir = first_some(
        overrides.runtime_dir.clone(),
        env::var("VIGIL_RUNTIME_DIR").ok().map(PathBuf::from),
        file_cfg.looping.runtime_dir.map(PathBuf::from),
    )
    .unwrap_or(defaults.looping.runtime_dir);

    let failure_threshold = first_some(
        overrides.failure_threshold,
        env_u32("VIGIL_FAILURE_THRESHOLD"),
        file_cfg.breaker.failure_threshold,
    )
    .unwrap_or(defaults.breaker.failure_threshold);

    let reset_timeout = first_some(
        overrides.reset_timeout_secs,
        env_u64("VIGIL_RESET_TIMEOUT_SECS"),
        file_cfg.breaker.reset_timeout_secs,
    )
    .map(Duration::from_secs)
    .unwrap_or(defaults.breaker.reset_timeout);

    let half_open_max_calls = first_some(
        None,
        env_u32("VIGIL_HALF_OPEN_MAX_CALLS"),
        file_cfg.breaker.half_open_max_calls,
    )
    .unwrap_or(defaults.breaker.half_open_max_calls);

    let backoff_factor = first_some(
        None,
        env_f64("VIGIL_BACKOFF_FACTOR"),
        file_cfg.breaker.backoff_factor,
    )
    .unwrap_or(defaults.breaker.backoff_factor);

    let max_backoff = first_some(
        None,
        env_u64("VIGIL_MAX_BACKOFF_SECS"),
        file_cfg.breaker.max_backoff_secs,
    )
    .map(Duration::from_secs)
    .unwrap_or(defaults.breaker.max_backoff);

    let max_degraded_time = first_some(
        overrides.max_degraded_secs,
        env_u64("VIGIL_MAX_DEGRADED_SECS"),
        file_cfg.degraded.max_degraded_secs,
    )
    .map(Duration::from_secs)
    .unwrap_or(defaults.degraded.max_degraded_time);

    let watchdog_timeout = first_some(
        overrides.watchdog_timeout_secs,
        env_u64("VIGIL_WATCHDOG_TIMEOUT_SECS"),
        file_cfg.guard.watchdog_timeout_secs,
    )
    .map(Duration::from_secs)
    .unwrap_or(defaults.guard.watchdog_timeout);

    let memory_limit_bytes = first_some(
        None,
        env_u64("VIGIL_MEMORY_LIMIT_MB"),
        file_cfg.guard.memory_limit_mb,
    )
    .map(|mb| mb.saturating_mul(1024 * 1024));

    let max_log_entries = first_some(
        None,
        env_usize("VIGIL_MAX_LOG_ENTRIES"),
        file_cfg.guard.max_log_entries,
    )
    .unwrap_or(defaults.guard.max_log_entries);

    let config = SupervisorConfig {
        looping: LoopConfig {
            max_cycles,
            drift_check_interval,
            cycle_delay,
            resources,
            runtime_dir,
        },
        breaker: BreakerConfig {
            failure_threshold,
            reset_timeout,
            half_open_max_calls,
            backoff_factor,
            max_backoff,
        },
        degraded: DegradedConfig { max_degraded_time },
        guard: GuardConfig {
            watchdog_timeout,
            memory_limit_bytes,
            max_log_entries,
        },
    };
    config.validate()?;
    Ok(config)
}

fn first_some<T>(a: Option<T>, b: Option<T>, c: Option<T>) -> Option<T> {
    a.or(b).or(c)
}

fn env_u32(key: &str) -> Option<u32> {
    env::var(key).ok()?.parse().ok()
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok()?.parse().ok()
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok()?.parse().ok()
}

fn env_f64(key: &str) -> Option<f64> {
    env::var(key).ok()?.trim().parse().ok()
}

fn env_csv(key: &str) -> Option<Vec<String>> {
    let value = env::var(key).ok()?;
    let parts = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        SupervisorConfig::default().validate().expect("defaults");
    }

    #[test]
    fn rejects_zero_threshold() {
        let cfg = BreakerConfig {
            failure_threshold: 0,
            ..BreakerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_backoff_below_one() {
        let cfg = BreakerConfig {
            backoff_factor: 0.5,
            ..BreakerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_nan_backoff() {
        let cfg = BreakerConfig {
            backoff_factor: f64::NAN,
            ..BreakerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_max_backoff_below_reset_timeout() {
        let cfg = BreakerConfig {
            reset_timeout: Duration::from_secs(10),
            max_backoff: Duration::from_secs(5),
            ..BreakerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn first_some_prefers_earliest() {
        assert_eq!(first_some(Some(1), Some(2), Some(3)), Some(1));
        assert_eq!(first_some(None, Some(2), Some(3)), Some(2));
        assert_eq!(first_some::<u8>(None, None, None), None);
    }
}
