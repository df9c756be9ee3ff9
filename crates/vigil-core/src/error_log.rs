//! Structured error records and the sinks they are written to.

use crate::classifier::{classify, error_kind};
use crate::io::{append_json_line, read_lines_reverse};
use anyhow::Result;
use chrono::Utc;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use vigil_types::{ErrorContext, ErrorRecord, ErrorType};

/// Destination for error records. Sinks must not fail the caller; write
/// problems are reported through `tracing` and dropped.
pub trait ErrorSink: Send + Sync {
    fn write(&self, record: &ErrorRecord);
}

/// Emits each record as one `tracing` error event.
#[derive(Debug, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn write(&self, record: &ErrorRecord) {
        tracing::error!(
            error_type = %record.error_type,
            error_kind = %record.error_kind,
            operation = record.operation.as_deref().unwrap_or("-"),
            context = ?record.context,
            "{}",
            record.message
        );
    }
}

/// Durable error store: one JSON record per line.
#[derive(Debug, Clone)]
pub struct JsonlErrorSink {
    path: PathBuf,
}

impl JsonlErrorSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Newest-first records; unparsable lines are skipped.
    pub fn recent(&self, limit: usize) -> Result<Vec<ErrorRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let lines = read_lines_reverse(&self.path, limit)?;
        Ok(lines
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

impl ErrorSink for JsonlErrorSink {
    fn write(&self, record: &ErrorRecord) {
        if let Err(err) = append_json_line(&self.path, record) {
            tracing::warn!(path = %self.path.display(), "error store write failed: {err:#}");
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryErrorSink {
    records: Mutex<Vec<ErrorRecord>>,
}

impl MemoryErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ErrorRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ErrorSink for MemoryErrorSink {
    fn write(&self, record: &ErrorRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
    }
}

/// Classifies (when needed) and records errors, fanning each record out to
/// every configured sink.
#[derive(Clone)]
pub struct ErrorLogger {
    sinks: Vec<Arc<dyn ErrorSink>>,
}

impl Default for ErrorLogger {
    fn default() -> Self {
        Self {
            sinks: vec![Arc::new(TracingErrorSink)],
        }
    }
}

impl std::fmt::Debug for ErrorLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorLogger")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl ErrorLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sinks(sinks: Vec<Arc<dyn ErrorSink>>) -> Self {
        Self { sinks }
    }

    pub fn add_sink(&mut self, sink: Arc<dyn ErrorSink>) {
        self.sinks.push(sink);
    }

    pub fn log(
        &self,
        error: &anyhow::Error,
        error_type: Option<ErrorType>,
        operation: Option<&str>,
        context: &ErrorContext,
    ) -> ErrorRecord {
        let record = ErrorRecord {
            timestamp: Utc::now().to_rfc3339(),
            error_type: error_type.unwrap_or_else(|| classify(error, context)),
            error_kind: error_kind(error),
            message: format!("{error:#}"),
            operation: operation.map(ToString::to_string),
            context: context.clone(),
        };
        for sink in &self.sinks {
            sink.write(&record);
        }
        record
    }
}

const LOGGED_MARKS_LEN: usize = 32;

thread_local! {
    static LOGGED: RefCell<VecDeque<(usize, String)>> = const { RefCell::new(VecDeque::new()) };
}

fn identity(error: &anyhow::Error) -> (usize, String) {
    let object: *const (dyn std::error::Error + Send + Sync + 'static) = &**error;
    (object.cast::<()>() as usize, format!("{error:#}"))
}

/// Note that `error` already has a record. Marks are per thread and only
/// hold while the error is alive; callers clear them with [`forget_logged`].
pub(crate) fn mark_logged(error: &anyhow::Error) {
    let mark = identity(error);
    LOGGED.with(|logged| {
        let mut logged = logged.borrow_mut();
        if logged.len() == LOGGED_MARKS_LEN {
            logged.pop_front();
        }
        logged.push_back(mark);
    });
}

/// Whether `error` was marked on this thread, consuming the mark.
pub(crate) fn take_logged(error: &anyhow::Error) -> bool {
    let mark = identity(error);
    LOGGED.with(|logged| {
        let mut logged = logged.borrow_mut();
        match logged.iter().position(|m| *m == mark) {
            Some(index) => {
                logged.remove(index);
                true
            }
            None => false,
        }
    })
}

pub(crate) fn forget_logged() {
    LOGGED.with(|logged| logged.borrow_mut().clear());
}
