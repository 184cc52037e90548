//! Error types, status codes and exit codes for searcher
//!
//! Every variant carries a plain message so the type stays `Clone`: the
//! outcome of one archive fetch is handed to every caller waiting on it.

use std::process::ExitCode;
use thiserror::Error;

/// Main error type for searcher operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SearcherError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("transient failure: {message}")]
    Transient { message: String },

    #[error("canceled: {reason}")]
    Canceled { reason: String },

    #[error("corrupt archive: {message}")]
    Corrupt { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("configuration error: {message}")]
    Config { message: String },
}

/// Coarse classification used by callers that only need to branch on the kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidRequest,
    NotFound,
    Transient,
    Canceled,
    Corrupt,
    Internal,
    Config,
}

impl SearcherError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn canceled(reason: impl Into<String>) -> Self {
        Self::Canceled {
            reason: reason.into(),
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Transient { .. } => ErrorKind::Transient,
            Self::Canceled { .. } => ErrorKind::Canceled,
            Self::Corrupt { .. } => ErrorKind::Corrupt,
            Self::Internal { .. } => ErrorKind::Internal,
            Self::Config { .. } => ErrorKind::Config,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }

    /// Errors caused by the caller's input; never worth retrying.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidRequest { .. } | Self::NotFound { .. })
    }

    /// Stable snake_case code sent to clients
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request",
            Self::NotFound { .. } => "not_found",
            Self::Transient { .. } => "transient",
            Self::Canceled { .. } => "canceled",
            Self::Corrupt { .. } => "corrupt",
            Self::Internal { .. } => "internal",
            Self::Config { .. } => "config",
        }
    }

    /// HTTP-style status for the response:
    /// - 400: malformed input
    /// - 404: repository or revision missing
    /// - 499: caller went away or ran out of time
    /// - 500: corrupt archive, broken invariant, bad configuration
    /// - 503: upstream or disk failure, retryable
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::Canceled { .. } => 499,
            Self::Corrupt { .. } | Self::Internal { .. } | Self::Config { .. } => 500,
            Self::Transient { .. } => 503,
        }
    }

    /// Convert error to a process exit code:
    /// - 1: runtime failure
    /// - 2: invalid configuration
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Config { .. } => ExitCode::from(2),
            _ => ExitCode::from(1),
        }
    }
}

impl From<std::io::Error> for SearcherError {
    fn from(err: std::io::Error) -> Self {
        Self::Transient {
            message: format!("I/O error: {}", err),
        }
    }
}

/// Result type alias for searcher operations
pub type Result<T> = std::result::Result<T, SearcherError>;
