//! Error types for the Forklift controller
//!
//! Provides structured error types for all controller components including
//! the inventory store, source collectors, admission webhooks and the plan
//! execution engine. Every error classifies into one of the [`ErrorKind`]s
//! which drive retry, REST status and admission decisions.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the controller
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Core Error Kinds
    // =========================================================================
    #[error("{kind} {id} not found")]
    NotFound { kind: String, id: String },

    #[error("Conflict: {kind} {id} modified concurrently")]
    Conflict { kind: String, id: String },

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Source API error ({code}): {message}")]
    SourceApi { code: u16, message: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Canceled")]
    Canceled,

    // =========================================================================
    // Library Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Kubeconfig error: {0}")]
    KubeConfig(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("XML parse error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Duration parse error: {0}")]
    DurationParse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classification of errors shared across the core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Transient,
    PermissionDenied,
    InvariantViolation,
    SourceApi,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::Transient => "Transient",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::InvariantViolation => "InvariantViolation",
            ErrorKind::SourceApi => "SourceAPIError",
            ErrorKind::Internal => "Internal",
        };
        write!(f, "{}", s)
    }
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Shorthand for a not-found error.
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Shorthand for an optimistic-lock conflict.
    pub fn conflict(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Error::Conflict {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Classify into the shared error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::Transient(_) | Error::Timeout(_) => ErrorKind::Transient,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::InvariantViolation(_) | Error::Configuration(_) | Error::DurationParse(_) => {
                ErrorKind::InvariantViolation
            }
            Error::SourceApi { code, .. } => match code {
                401 | 403 => ErrorKind::PermissionDenied,
                404 => ErrorKind::NotFound,
                409 => ErrorKind::Conflict,
                429 | 500..=599 => ErrorKind::Transient,
                _ => ErrorKind::SourceApi,
            },
            Error::Kube(kube::Error::Api(resp)) => match resp.code {
                401 | 403 => ErrorKind::PermissionDenied,
                404 => ErrorKind::NotFound,
                409 => ErrorKind::Conflict,
                422 | 400 => ErrorKind::InvariantViolation,
                _ => ErrorKind::Transient,
            },
            Error::Kube(_) => ErrorKind::Transient,
            Error::Http(e) => {
                if let Some(status) = e.status() {
                    match status.as_u16() {
                        401 | 403 => ErrorKind::PermissionDenied,
                        404 => ErrorKind::NotFound,
                        409 => ErrorKind::Conflict,
                        429 | 500..=599 => ErrorKind::Transient,
                        _ => ErrorKind::SourceApi,
                    }
                } else {
                    ErrorKind::Transient
                }
            }
            Error::Xml(_) => ErrorKind::SourceApi,
            Error::Io(_) => ErrorKind::Transient,
            Error::Internal(_)
            | Error::KubeConfig(_)
            | Error::JsonParse(_)
            | Error::Canceled => ErrorKind::Internal,
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self.kind() {
            ErrorKind::Transient => ErrorAction::RequeueWithBackoff,
            ErrorKind::Conflict => ErrorAction::RequeueAfter(Duration::from_secs(1)),
            ErrorKind::NotFound => ErrorAction::RequeueAfter(Duration::from_secs(30)),
            ErrorKind::SourceApi => ErrorAction::RequeueAfter(Duration::from_secs(60)),
            ErrorKind::PermissionDenied | ErrorKind::InvariantViolation => ErrorAction::NoRequeue,
            ErrorKind::Internal => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Check if this error is an optimistic-lock conflict
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    /// Check if this error reports a missing entity
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// HTTP status code used when surfacing this error over REST
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::PermissionDenied => 403,
            ErrorKind::InvariantViolation => 400,
            _ => 500,
        }
    }
}

/// Result type alias for the controller
pub type Result<T> = std::result::Result<T, Error>;
