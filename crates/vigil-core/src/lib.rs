//! Supervision for long-running autonomous loops: error classification,
//! per-operation circuit breakers, a cycle watchdog and a degraded mode that
//! runs fallback actions when normal work cannot proceed.

pub mod actions;
pub mod circuit_breaker;
pub mod classifier;
pub mod degraded;
pub mod error;
pub mod error_log;
pub mod guard;
pub mod heartbeat;
pub mod io;
pub mod logging;
pub mod recovery;
pub mod resources;
pub mod status;
pub mod supervisor;

pub use actions::{ActionContext, ActionRegistry, AlternativeAction};
pub use circuit_breaker::{
    write_breaker_snapshot, BreakerPermit, BreakerRegistry, CircuitBreaker, CircuitBreakerAction,
};
pub use classifier::classify;
pub use degraded::DegradedSession;
pub use error::{OperationError, SupervisorError};
pub use error_log::{ErrorLogger, ErrorSink, JsonlErrorSink, MemoryErrorSink, TracingErrorSink};
pub use guard::{CancelToken, GuardHooks, GuardReport, LoopGuard};
pub use heartbeat::{
    HeartbeatSink, MemoryHeartbeat, NoopHeartbeat, StatusFileHeartbeat, TracingHeartbeat,
};
pub use recovery::{RecoveryOutcome, RecoveryRegistry, RecoveryStrategy, RetryAfterDelay};
pub use resources::ResourceSnapshot;
pub use status::read_loop_status;
pub use supervisor::{
    CycleContext, Drift, ExitReason, LoopHooks, LoopOutcome, StopHandle, SupervisedLoop,
    SupervisorServices,
};
