//! Crate-wide error type for the autonomic runtime core.

use thiserror::Error;

/// Closed error taxonomy surfaced in structured dispatch results and propagated
/// internally between components. Mirrors the error kinds named in the system's
/// error-handling design so every subsystem raises the same vocabulary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("not_found")]
    NotFound,
    #[error("crash")]
    Crash,
    #[error("empty_output")]
    EmptyOutput,
    #[error("parse_error")]
    ParseError,
    #[error("tool_error")]
    ToolError,
    #[error("timeout")]
    Timeout,
    #[error("exception")]
    Exception,
    #[error("approval_required")]
    ApprovalRequired,
    #[error("dangerous_code_blocked")]
    DangerousCodeBlocked,
    #[error("network_code_blocked")]
    NetworkCodeBlocked,
    #[error("path_outside_sandbox")]
    PathOutsideSandbox,
    #[error("invalid_input")]
    InvalidInput,
    #[error("regression_failed")]
    RegressionFailed,
    #[error("budget_exceeded")]
    BudgetExceeded,
    #[error("cancelled")]
    Cancelled,
    #[error("stasis")]
    Stasis,
    #[error("io_error")]
    IoError,
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("{kind}: {detail}")]
    Kind { kind: ErrorKind, detail: String },
}

impl CoreError {
    pub fn kind(kind: ErrorKind, detail: impl Into<String>) -> Self {
        CoreError::Kind {
            kind,
            detail: detail.into(),
        }
    }

    /// Best-effort mapping to the closed taxonomy, for errors that didn't originate
    /// from a `Kind` variant (e.g. bubbled-up `io::Error`).
    pub fn as_kind(&self) -> ErrorKind {
        match self {
            CoreError::Io(_) => ErrorKind::IoError,
            CoreError::Json(_) => ErrorKind::ParseError,
            CoreError::Sqlite(_) => ErrorKind::IoError,
            CoreError::Kind { kind, .. } => kind.clone(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
