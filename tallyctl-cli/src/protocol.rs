//! Structured JSON output for scripts and agents
//!
//! With `--json`, every command prints one envelope on stdout:
//! ```json
//! {
//!   "status": "success" | "error",
//!   "data": { ... },
//!   "error": { "code": "ERR_...", "message": "...", "retryable": false }
//! }
//! ```

use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;
use tallyctl_core::{ErrorKind, TxError, ValidationError};

/// Global JSON mode state (set by --json flag)
static JSON_MODE: OnceLock<bool> = OnceLock::new();

pub fn init_json_mode(json_flag: bool) {
    JSON_MODE.set(json_flag).ok();
}

pub fn is_json_mode() -> bool {
    *JSON_MODE.get().unwrap_or(&false)
}

/// Standard response envelope
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub status: ResponseStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    /// Rerunning the command may succeed
    pub retryable: bool,
    /// The mutation may or may not have been applied
    pub outcome_unknown: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Machine-readable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Request errors
    ErrInvalidInput,
    ErrPreconditionViolated,
    ErrNotFound,

    // Store errors
    ErrDatabaseConnection,
    ErrStatementFailed,
    ErrDatabaseQuery,
    ErrTimeout,

    // Outcome unknown
    ErrCommitUnknown,
    ErrRollbackFailed,

    // Configuration errors
    ErrConfigInvalid,

    ErrInternal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_string(self).unwrap_or_else(|_| "\"ERR_INTERNAL\"".to_string());
        write!(f, "{}", s.trim_matches('"'))
    }
}

impl From<ErrorKind> for ErrorCode {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::ConnectionUnavailable => Self::ErrDatabaseConnection,
            ErrorKind::PreconditionViolated => Self::ErrPreconditionViolated,
            ErrorKind::NotFound => Self::ErrNotFound,
            ErrorKind::StatementFailed => Self::ErrStatementFailed,
            ErrorKind::CommitFailed => Self::ErrCommitUnknown,
            ErrorKind::RollbackFailed => Self::ErrRollbackFailed,
            ErrorKind::Projection => Self::ErrDatabaseQuery,
            ErrorKind::InvalidState => Self::ErrInternal,
        }
    }
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: ResponseStatus::Success,
            data: Some(data),
            error: None,
        }
    }

    pub fn print(&self) {
        if let Ok(json) = serde_json::to_string_pretty(self) {
            println!("{}", json);
        }
    }
}

/// Map an anyhow error to an error envelope.
///
/// Typed errors anywhere in the chain decide the code; the message keeps the
/// outermost context.
pub fn map_error(err: &anyhow::Error) -> ApiResponse<()> {
    let message = err.to_string();

    let tx = err.chain().find_map(|e| e.downcast_ref::<TxError>());
    let (code, retryable, outcome_unknown) = match tx {
        Some(tx) => (
            ErrorCode::from(tx.kind()),
            tx.is_retryable(),
            tx.outcome_unknown(),
        ),
        None => (classify_error(err), false, false),
    };

    let details = if err.chain().count() > 1 {
        Some(
            err.chain()
                .skip(1)
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(" → "),
        )
    } else {
        None
    };

    ApiResponse {
        status: ResponseStatus::Error,
        data: None,
        error: Some(ApiError {
            code,
            message,
            retryable,
            outcome_unknown,
            details,
        }),
    }
}

fn classify_error(err: &anyhow::Error) -> ErrorCode {
    if err
        .chain()
        .any(|e| e.downcast_ref::<ValidationError>().is_some())
    {
        return ErrorCode::ErrInvalidInput;
    }

    let lower = err.to_string().to_lowercase();
    if lower.contains("config") {
        return ErrorCode::ErrConfigInvalid;
    }
    if lower.contains("timeout") || lower.contains("timed out") {
        return ErrorCode::ErrTimeout;
    }
    if lower.contains("database") || lower.contains("connection") {
        return ErrorCode::ErrDatabaseConnection;
    }
    ErrorCode::ErrInternal
}

/// Print JSON in json mode, or run the human closure otherwise
pub fn output<T, F>(data: T, human_output: F)
where
    T: Serialize,
    F: FnOnce(&T),
{
    if is_json_mode() {
        ApiResponse::success(data).print();
    } else {
        human_output(&data);
    }
}

pub fn output_message(message: impl Into<String>) {
    let msg = message.into();
    if is_json_mode() {
        ApiResponse::success(serde_json::json!({ "message": msg })).print();
    } else {
        println!("{}", msg);
    }
}

/// Print the error envelope in json mode, then pass the error on
pub fn handle_result<T>(result: anyhow::Result<T>) -> anyhow::Result<T> {
    if let Err(err) = &result {
        if is_json_mode() {
            map_error(err).print();
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use tallyctl_core::{AlbumId, OrderRequest, StoreError};

    #[test]
    fn test_success_response() {
        let resp = ApiResponse::success(serde_json::json!({"count": 42}));
        assert_eq!(resp.status, ResponseStatus::Success);
        assert!(resp.data.is_some());
        assert!(resp.error.is_none());
    }

    #[test]
    fn test_tx_error_mapping() {
        let err = anyhow::Error::new(TxError::violated("insufficient quantity"))
            .context("order for album 2 failed");
        let resp = map_error(&err);
        let api = resp.error.unwrap();
        assert_eq!(api.code, ErrorCode::ErrPreconditionViolated);
        assert_eq!(api.message, "order for album 2 failed");
        assert!(!api.retryable);
        assert!(api.details.unwrap().contains("insufficient quantity"));
    }

    #[test]
    fn test_commit_failure_flags_unknown_outcome() {
        let err = anyhow::Error::new(TxError::CommitFailed {
            source: StoreError::Connection("reset".into()),
        });
        let api = map_error(&err).error.unwrap();
        assert_eq!(api.code, ErrorCode::ErrCommitUnknown);
        assert!(api.outcome_unknown);
        assert_eq!(api.code.to_string(), "ERR_COMMIT_UNKNOWN");
    }

    #[test]
    fn test_validation_error_is_invalid_input() {
        let err = OrderRequest::new(AlbumId(1), 0, None)
            .context("bad order")
            .unwrap_err();
        assert_eq!(map_error(&err).error.unwrap().code, ErrorCode::ErrInvalidInput);
    }

    #[test]
    fn test_json_serialization() {
        let resp = ApiResponse::success(serde_json::json!({"test": true}));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"status\":\"success\""));
        assert!(json.contains("\"test\":true"));
    }
}
