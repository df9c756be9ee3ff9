//! Maps arbitrary errors onto the fixed [`ErrorType`] taxonomy.
//!
//! Classification is pure and total: every input yields a tag, unmatched
//! errors fall through to [`ErrorType::Unknown`].

use crate::error::{OperationError, SupervisorError};
use std::error::Error as StdError;
use std::io;
use vigil_types::{ErrorContext, ErrorType};

/// Context key whose value, when it parses as an [`ErrorType`], wins over
/// every other rule.
pub const ERROR_TYPE_HINT: &str = "error_type";

pub fn classify(error: &anyhow::Error, context: &ErrorContext) -> ErrorType {
    if let Some(hint) = context.get(ERROR_TYPE_HINT) {
        if let Ok(tag) = hint.parse::<ErrorType>() {
            return tag;
        }
    }

    error
        .chain()
        .map(classify_cause)
        .find(|t| *t != ErrorType::Unknown)
        .unwrap_or(ErrorType::Unknown)
}

/// Short name describing what kind of error this is, for log records.
pub fn error_kind(error: &anyhow::Error) -> String {
    error
        .chain()
        .find_map(kind_name_of)
        .unwrap_or_else(|| "Error".to_string())
}

/// Classify a bare kind name such as `"ConnectionError"` or `"Timeout"`.
pub fn classify_kind_name(name: &str) -> ErrorType {
    let normalized: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if normalized.is_empty() {
        return ErrorType::Unknown;
    }

    if let Some(tag) = exact_kind(&normalized) {
        return tag;
    }

    if normalized.contains("timeout") || normalized.contains("timedout") {
        ErrorType::Timeout
    } else if normalized.contains("permission") || normalized.contains("access") {
        ErrorType::Permission
    } else if normalized.contains("connection") || normalized.contains("network") {
        ErrorType::Connectivity
    } else if normalized.contains("resource") {
        ErrorType::ResourceUnavailable
    } else if normalized.contains("validation") || normalized.contains("value") {
        ErrorType::Validation
    } else if normalized.contains("corrupt") {
        ErrorType::CorruptData
    } else if normalized.contains("concurren") || normalized.contains("deadlock") {
        ErrorType::Concurrency
    } else {
        ErrorType::Unknown
    }
}

fn exact_kind(normalized: &str) -> Option<ErrorType> {
    let tag = match normalized {
        "timeouterror" | "timedout" | "elapsed" => ErrorType::Timeout,
        "connectionerror" | "connectionrefusederror" | "connectionreseterror"
        | "connectionabortederror" | "brokenpipeerror" | "brokenpipe" => ErrorType::Connectivity,
        "permissionerror" | "permissiondenied" => ErrorType::Permission,
        "filenotfounderror" | "notfound" => ErrorType::ResourceUnavailable,
        "valueerror" | "typeerror" | "keyerror" | "invalidinput" => ErrorType::Validation,
        "jsondecodeerror" | "unicodedecodeerror" | "invaliddata" => ErrorType::CorruptData,
        "poisonerror" | "lockerror" | "deadlockerror" => ErrorType::Concurrency,
        "interrupted" | "interruptederror" | "wouldblock" => ErrorType::Transient,
        "notimplementederror" | "unsupported" => ErrorType::Persistent,
        _ => return None,
    };
    Some(tag)
}

fn classify_cause(cause: &(dyn StdError + 'static)) -> ErrorType {
    if let Some(op) = cause.downcast_ref::<OperationError>() {
        return classify_kind_name(&op.kind);
    }
    if let Some(err) = cause.downcast_ref::<SupervisorError>() {
        return match err {
            SupervisorError::CircuitOpen { .. } => ErrorType::ResourceUnavailable,
            SupervisorError::WatchdogTimeout { .. } => ErrorType::Timeout,
            SupervisorError::DuplicateAction(_) => ErrorType::Validation,
        };
    }
    if let Some(err) = cause.downcast_ref::<io::Error>() {
        return classify_io_kind(err.kind());
    }
    if cause.downcast_ref::<serde_json::Error>().is_some() {
        return ErrorType::CorruptData;
    }
    debug_identifier(cause)
        .map(|name| classify_kind_name(&name))
        .unwrap_or(ErrorType::Unknown)
}

fn classify_io_kind(kind: io::ErrorKind) -> ErrorType {
    match kind {
        io::ErrorKind::TimedOut => ErrorType::Timeout,
        io::ErrorKind::PermissionDenied => ErrorType::Permission,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::AddrNotAvailable => ErrorType::Connectivity,
        io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => ErrorType::CorruptData,
        io::ErrorKind::InvalidInput => ErrorType::Validation,
        io::ErrorKind::NotFound => ErrorType::ResourceUnavailable,
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => ErrorType::Transient,
        _ => ErrorType::Unknown,
    }
}

fn kind_name_of(cause: &(dyn StdError + 'static)) -> Option<String> {
    if let Some(op) = cause.downcast_ref::<OperationError>() {
        return Some(op.kind.clone());
    }
    if let Some(err) = cause.downcast_ref::<io::Error>() {
        return Some(format!("io::{:?}", err.kind()));
    }
    if cause.downcast_ref::<serde_json::Error>().is_some() {
        return Some("serde_json::Error".to_string());
    }
    debug_identifier(cause)
}

/// Leading identifier of the `Debug` rendering: the variant name for enums,
/// the type name for structs. Ad-hoc string errors render quoted and
/// `anyhow` context layers render as a bare `Error`; both yield nothing.
fn debug_identifier(cause: &(dyn StdError + 'static)) -> Option<String> {
    let rendered = format!("{cause:?}");
    let ident: String = rendered
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if ident.is_empty() || ident == "Error" || ident.starts_with(|c: char| c.is_ascii_digit()) {
        None
    } else {
        Some(ident)
    }
}
