use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;
use vigil_config::BreakerConfig;
use vigil_core::{
    write_breaker_snapshot, BreakerRegistry, ErrorLogger, JsonlErrorSink, OperationError,
    SupervisorError,
};
use vigil_types::{BreakerStatus, CircuitState, ErrorType};

fn fail() -> Result<()> {
    Err(anyhow!("upstream exploded"))
}

fn registry() -> BreakerRegistry {
    BreakerRegistry::new(BreakerConfig::default(), ErrorLogger::with_sinks(Vec::new()))
}

#[test]
fn open_then_probe_then_close() {
    let registry = registry();
    let breaker = registry.register(
        "op1",
        BreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(1),
            half_open_max_calls: 1,
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(60),
        },
    );

    for _ in 0..3 {
        assert!(breaker.call(fail).is_err());
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let rejected = breaker.call(|| Ok(())).expect_err("open circuit rejects");
    assert!(SupervisorError::is_circuit_open(&rejected));

    thread::sleep(Duration::from_millis(1100));

    let observed = breaker
        .call(|| Ok(breaker.state()))
        .expect("probe admitted");
    assert_eq!(observed, CircuitState::HalfOpen);
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
    assert_eq!(breaker.current_timeout(), Duration::from_secs(1));
}

#[test]
fn exactly_threshold_failures_open_the_circuit() {
    for threshold in 1..=6u32 {
        let registry = registry();
        let breaker = registry.register(
            "counted",
            BreakerConfig {
                failure_threshold: threshold,
                ..BreakerConfig::default()
            },
        );

        for _ in 0..threshold - 1 {
            breaker.record_failure(None);
        }
        assert_eq!(breaker.state(), CircuitState::Closed, "threshold {threshold}");
        breaker.record_failure(None);
        assert_eq!(breaker.state(), CircuitState::Open, "threshold {threshold}");
    }
}

#[test]
fn repeated_half_open_failures_grow_timeout_to_cap() {
    let registry = registry();
    let breaker = registry.register(
        "flaky",
        BreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_millis(10),
            half_open_max_calls: 1,
            backoff_factor: 2.0,
            max_backoff: Duration::from_millis(50),
        },
    );
    breaker.record_failure(None);
    assert_eq!(breaker.current_timeout(), Duration::from_millis(10));

    for expected_ms in [20, 40, 50, 50] {
        thread::sleep(breaker.current_timeout() + Duration::from_millis(5));
        assert!(breaker.call(fail).is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.current_timeout(), Duration::from_millis(expected_ms));
    }
}

#[test]
fn successes_never_drive_failures_negative() {
    let registry = registry();
    let breaker = registry.guard("healing", None);

    breaker.record_failure(None);
    for _ in 0..20 {
        breaker.call(|| Ok(())).expect("closed circuit admits");
    }

    assert_eq!(breaker.failure_count(), 0);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[test]
fn fallback_runs_while_circuit_is_open() {
    let registry = registry();
    let breaker = registry.register(
        "primary",
        BreakerConfig {
            failure_threshold: 1,
            ..BreakerConfig::default()
        },
    );
    assert!(breaker.call(fail).is_err());

    let answer = breaker
        .call_with_fallback(|| Ok("fresh"), |_| Ok("cached"))
        .expect("fallback");

    assert_eq!(answer, "cached");
}

#[test]
fn errors_pass_through_unchanged() {
    let registry = registry();
    let breaker = registry.guard("typed", None);

    let err = breaker
        .call(|| -> Result<()> { Err(OperationError::new("ConnectionError", "refused").into()) })
        .expect_err("propagates");

    let passed = err.downcast_ref::<OperationError>().expect("same error type");
    assert_eq!(passed.kind, "ConnectionError");
}

#[test]
fn failures_land_in_jsonl_store() {
    let dir = tempdir().expect("tempdir");
    let sink = Arc::new(JsonlErrorSink::new(dir.path().join("errors.jsonl")));
    let registry = BreakerRegistry::new(
        BreakerConfig::default(),
        ErrorLogger::with_sinks(vec![sink.clone()]),
    );
    let breaker = registry.guard("fetch_tasks", None);

    let _ = breaker.call(|| -> Result<()> { Err(OperationError::new("TimeoutError", "slow").into()) });

    let records = sink.recent(5).expect("recent");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].error_type, ErrorType::Timeout);
    assert_eq!(records[0].operation.as_deref(), Some("fetch_tasks"));
    assert_eq!(records[0].message, "TimeoutError: slow");
}

#[test]
fn snapshot_covers_every_breaker() {
    let dir = tempdir().expect("tempdir");
    let registry = registry();
    registry.guard("b", None);
    registry
        .register(
            "a",
            BreakerConfig {
                failure_threshold: 1,
                ..BreakerConfig::default()
            },
        )
        .record_failure(Some(ErrorType::Persistent));
    let path = dir.path().join("breakers.json");

    write_breaker_snapshot(&path, &registry).expect("write");

    let raw = std::fs::read_to_string(&path).expect("read");
    let statuses: Vec<BreakerStatus> = serde_json::from_str(&raw).expect("parse");
    let names: Vec<&str> = statuses.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);
    assert_eq!(statuses[0].state, CircuitState::Open);
    assert_eq!(statuses[0].current_timeout_ms, 60_000);
}

#[test]
fn breakers_are_shared_across_threads() {
    let registry = Arc::new(registry());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let registry = registry.clone();
            thread::spawn(move || {
                registry.guard("shared", None).record_failure(None);
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("join");
    }

    assert_eq!(registry.len(), 1);
    assert_eq!(registry.get("shared").expect("shared").failure_count(), 4);
}
