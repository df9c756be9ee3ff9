use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Free-form key/value context attached to an error or action invocation.
pub type ErrorContext = BTreeMap<String, String>;

/// Fixed failure taxonomy produced by classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Transient,
    Persistent,
    ResourceUnavailable,
    Concurrency,
    Validation,
    Permission,
    Timeout,
    Connectivity,
    CorruptData,
    Unknown,
}

impl ErrorType {
    pub const ALL: [ErrorType; 10] = [
        ErrorType::Transient,
        ErrorType::Persistent,
        ErrorType::ResourceUnavailable,
        ErrorType::Concurrency,
        ErrorType::Validation,
        ErrorType::Permission,
        ErrorType::Timeout,
        ErrorType::Connectivity,
        ErrorType::CorruptData,
        ErrorType::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorType::Transient => "transient",
            ErrorType::Persistent => "persistent",
            ErrorType::ResourceUnavailable => "resource_unavailable",
            ErrorType::Concurrency => "concurrency",
            ErrorType::Validation => "validation",
            ErrorType::Permission => "permission",
            ErrorType::Timeout => "timeout",
            ErrorType::Connectivity => "connectivity",
            ErrorType::CorruptData => "corrupt_data",
            ErrorType::Unknown => "unknown",
        }
    }

    /// Errors worth a quick retry.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorType::Transient | ErrorType::Timeout | ErrorType::Connectivity
        )
    }

    /// Errors that should take the failing operation out of rotation.
    pub fn disables_operation(self) -> bool {
        matches!(self, ErrorType::Persistent | ErrorType::Concurrency)
    }

    /// Errors that need operator or configuration attention.
    pub fn needs_attention(self) -> bool {
        matches!(
            self,
            ErrorType::Validation
                | ErrorType::Permission
                | ErrorType::CorruptData
                | ErrorType::ResourceUnavailable
        )
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        ErrorType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| format!("unknown error type: {s}"))
    }
}

/// One structured error log record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorRecord {
    pub timestamp: String,
    pub error_type: ErrorType,
    pub error_kind: String,
    pub message: String,
    pub operation: Option<String>,
    #[serde(default)]
    pub context: ErrorContext,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::HalfOpen => "half_open",
            CircuitState::Open => "open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one registered circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub successful_calls: u32,
    pub half_open_calls: u32,
    pub last_failure_at_epoch: Option<u64>,
    pub current_timeout_ms: u64,
}

/// Kind of work a fallback action performs while normal operation is blocked.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    Documentation,
    Analysis,
    Diagnostics,
    ToolSelfTest,
    Cleanup,
    Planning,
}

impl ActionCategory {
    /// Lower runs first in degraded mode.
    pub fn priority(self) -> u8 {
        match self {
            ActionCategory::Documentation => 0,
            ActionCategory::Diagnostics => 1,
            ActionCategory::Analysis => 2,
            ActionCategory::ToolSelfTest => 3,
            ActionCategory::Cleanup => 4,
            ActionCategory::Planning => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionCategory::Documentation => "documentation",
            ActionCategory::Analysis => "analysis",
            ActionCategory::Diagnostics => "diagnostics",
            ActionCategory::ToolSelfTest => "tool_self_test",
            ActionCategory::Cleanup => "cleanup",
            ActionCategory::Planning => "planning",
        }
    }
}

impl fmt::Display for ActionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Telemetry for one finished degraded-mode session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct DegradedSummary {
    pub reason: String,
    pub duration_ms: u64,
    pub attempts: u32,
    pub successes: u32,
    pub failures: u32,
    pub categories: Vec<ActionCategory>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Healthy,
    Recovered,
    Degraded,
}

impl CycleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CycleStatus::Healthy => "healthy",
            CycleStatus::Recovered => "recovered",
            CycleStatus::Degraded => "degraded",
        }
    }
}

/// Per-cycle liveness report handed to a heartbeat sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Heartbeat {
    pub loop_name: String,
    pub cycle_count: u64,
    pub status: CycleStatus,
    pub duration_ms: u64,
    pub at_epoch: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopStatus {
    pub state: String,
    pub loop_name: String,
    pub cycle_count: u64,
    pub last_cycle_status: Option<CycleStatus>,
    pub last_cycle_duration_ms: u64,
    pub last_error: Option<String>,
    pub started_at_epoch: u64,
    pub last_heartbeat_at_epoch: u64,
    pub updated_at_epoch: u64,
}

impl Default for LoopStatus {
    fn default() -> Self {
        Self {
            state: "idle".to_string(),
            loop_name: String::new(),
            cycle_count: 0,
            last_cycle_status: None,
            last_cycle_duration_ms: 0,
            last_error: None,
            started_at_epoch: 0,
            last_heartbeat_at_epoch: 0,
            updated_at_epoch: 0,
        }
    }
}
