//! Normalized error shape for the UI error feed.
//!
//! Module errors (`TransportError`, `StoreError`, ...) stay precise for
//! callers. Anything that has to be shown to the user without unwinding
//! the mutation path is converted into a [`SyncError`] and pushed on the
//! notification channel instead.

use std::fmt;

use planner_proto::event::{CommandFailure, FailureKind};

use crate::transport::TransportError;

/// Category of a user-visible error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A move or edit was rejected locally; never reaches the network.
    Validation,
    /// The backend is unreachable.
    Network,
    /// The backend refused the action.
    Authorization,
    /// The entity does not exist server-side.
    NotFound,
    /// Concurrent-edit contention.
    Conflict,
    /// The backend failed internally.
    ServerError,
    /// Anything else.
    Unknown,
}

impl ErrorKind {
    /// Default user-facing message for the kind.
    #[must_use]
    pub const fn default_message(self) -> &'static str {
        match self {
            Self::Validation => "Please check your input",
            Self::Network => "Unable to connect to the server",
            Self::Authorization => "You do not have permission to perform this action",
            Self::NotFound => "The requested resource was not found",
            Self::Conflict => "Another user changed this task at the same time",
            Self::ServerError => "An unexpected server error occurred",
            Self::Unknown => "An unexpected error occurred",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validation => "validation",
            Self::Network => "network",
            Self::Authorization => "authorization",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::ServerError => "server_error",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// One entry on the error feed: kind, user-facing message, details.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SyncError {
    /// Category.
    pub kind: ErrorKind,
    /// Short message suitable for a toast.
    pub message: String,
    /// Technical details for logs or an expandable panel.
    pub details: Option<String>,
}

impl SyncError {
    /// Creates an error with the kind's default message.
    #[must_use]
    pub fn new(kind: ErrorKind, details: impl Into<Option<String>>) -> Self {
        Self {
            kind,
            message: kind.default_message().to_string(),
            details: details.into(),
        }
    }

    /// Creates an error with a custom message.
    #[must_use]
    pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// The terminal error surfaced when the reconnect budget is exhausted.
    #[must_use]
    pub fn reconnect_exhausted(attempts: u32, last_error: Option<&str>) -> Self {
        Self {
            kind: ErrorKind::Network,
            message: "Unable to reconnect to server".to_string(),
            details: Some(format!(
                "gave up after {attempts} attempts; last error: {}",
                last_error.unwrap_or("none")
            )),
        }
    }
}

impl From<&TransportError> for SyncError {
    fn from(err: &TransportError) -> Self {
        Self::new(ErrorKind::Network, err.to_string())
    }
}

impl From<&CommandFailure> for SyncError {
    fn from(failure: &CommandFailure) -> Self {
        let kind = match failure.kind {
            FailureKind::Validation => ErrorKind::Validation,
            FailureKind::Authorization => ErrorKind::Authorization,
            FailureKind::NotFound => ErrorKind::NotFound,
            FailureKind::Conflict => ErrorKind::Conflict,
            FailureKind::Server => ErrorKind::ServerError,
        };
        let details = match &failure.task_id {
            Some(task) => format!("{} on task {task}: {}", failure.command, failure.message),
            None => format!("{}: {}", failure.command, failure.message),
        };
        Self::new(kind, details)
    }
}
