use strum::Display;
use thiserror::Error;

use crate::task::TaskStatus;

/// Coarse classification used to decide retry and propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Network failure or timeout talking to a collaborator.
    Transport,
    /// Malformed input caught before any network call, or rejected as invalid downstream.
    Validation,
    /// A remote generation job reported failure.
    ProviderFailure,
    /// The downstream service could not parse the payload format.
    Parsing,
    /// Credential or token rejected.
    Auth,
    /// The downstream service failed on its side.
    Server,
    /// A referenced session or task does not exist.
    NotFound,
    /// The backing session store failed.
    Store,
    Internal,
}

/// Errors produced by the orchestration core and its collaborators.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("invalid input: {message}")]
    Validation {
        message: String,
        /// HTTP status when the rejection came from a remote service.
        status: Option<u16>,
    },

    #[error("generation failed: {reason}")]
    ProviderFailure { reason: String },

    #[error("payload rejected as unparseable: {message}")]
    Parsing { message: String, status: Option<u16> },

    #[error("credential rejected ({message}); sign in again and retry")]
    Auth { message: String },

    #[error("downstream server error: {message}")]
    Server { message: String, status: Option<u16> },

    #[error("task {task} cannot move from {from} to {to}")]
    InvalidTransition {
        task: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task not found: {task}")]
    TaskNotFound { task: String },

    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("no session is loaded")]
    NoActiveSession,

    #[error("session store error: {message}")]
    Store { message: String },

    #[error("I/O error: {message}")]
    Io { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
            status: None,
        }
    }

    pub fn provider_failure(reason: impl Into<String>) -> Self {
        Error::ProviderFailure {
            reason: reason.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Error::Store {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport { .. } => ErrorKind::Transport,
            Error::Validation { .. } | Error::InvalidTransition { .. } => ErrorKind::Validation,
            Error::ProviderFailure { .. } => ErrorKind::ProviderFailure,
            Error::Parsing { .. } => ErrorKind::Parsing,
            Error::Auth { .. } => ErrorKind::Auth,
            Error::Server { .. } => ErrorKind::Server,
            Error::TaskNotFound { .. }
            | Error::SessionNotFound { .. }
            | Error::NoActiveSession => ErrorKind::NotFound,
            Error::Store { .. } => ErrorKind::Store,
            Error::Io { .. } | Error::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// HTTP status attached by a remote service, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Validation { status, .. }
            | Error::Parsing { status, .. }
            | Error::Server { status, .. } => *status,
            _ => None,
        }
    }

    /// Human-readable message without the variant prefix.
    pub fn message(&self) -> String {
        match self {
            Error::Transport { message }
            | Error::Validation { message, .. }
            | Error::Parsing { message, .. }
            | Error::Auth { message }
            | Error::Server { message, .. }
            | Error::Store { message }
            | Error::Io { message }
            | Error::Internal { message } => message.clone(),
            Error::ProviderFailure { reason } => reason.clone(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal {
            message: format!("JSON error: {e}"),
        }
    }
}
