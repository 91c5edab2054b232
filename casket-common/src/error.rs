use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Whether a failed fetch is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Transient,
    Permanent,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchErrorKind::Transient => f.write_str("transient"),
            FetchErrorKind::Permanent => f.write_str("permanent"),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum CasketError {
    #[error("I/O Error: {0}")]
    Io(#[from] Arc<std::io::Error>),

    #[error("HTTP Request Error: {0}")]
    Http(#[from] Arc<reqwest::Error>),

    #[error("JSON Parsing Error: {0}")]
    Json(#[from] Arc<serde_json::Error>),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Validation Error: {0}")]
    Validation(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("{token} is blocked: {reason}")]
    LifecycleBlocked { token: String, reason: String },

    #[error("Failed to download {token} from {url} ({kind}): {message}")]
    Fetch {
        token: String,
        url: String,
        kind: FetchErrorKind,
        message: String,
    },

    #[error("Checksum mismatch for {}: expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Staging Error: {0}")]
    Stage(String),

    #[error("Installation of {token} failed at step {step_index}: {cause}")]
    Install {
        token: String,
        step_index: usize,
        cause: String,
    },

    #[error("Uninstall of {token} failed at step {step}: {cause}")]
    Uninstall {
        token: String,
        step: String,
        cause: String,
    },

    #[error(
        "{token} was left in an unclean state: {cause}; rollback could not undo: {}",
        failures.join("; ")
    )]
    UncleanState {
        token: String,
        cause: String,
        failures: Vec<String>,
    },

    #[error("Transaction for {0} was cancelled")]
    Cancelled(String),

    #[error("Failed to execute command: {0}")]
    CommandExec(String),

    #[error("Generic Error: {0}")]
    Generic(String),
}

impl CasketError {
    /// Process exit code the CLI reports for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            CasketError::LifecycleBlocked { .. } => 10,
            CasketError::ChecksumMismatch { .. } => 11,
            CasketError::Fetch { .. } | CasketError::Http(_) => 12,
            CasketError::Install { .. } => 13,
            CasketError::NotFound(_) => 14,
            CasketError::Uninstall { .. } => 15,
            CasketError::UncleanState { .. } => 16,
            CasketError::Stage(_) => 17,
            CasketError::Cancelled(_) => 18,
            _ => 1,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CasketError::Fetch {
                kind: FetchErrorKind::Transient,
                ..
            }
        )
    }
}

impl From<std::io::Error> for CasketError {
    fn from(err: std::io::Error) -> Self {
        CasketError::Io(Arc::new(err))
    }
}

impl From<reqwest::Error> for CasketError {
    fn from(err: reqwest::Error) -> Self {
        CasketError::Http(Arc::new(err))
    }
}

impl From<serde_json::Error> for CasketError {
    fn from(err: serde_json::Error) -> Self {
        CasketError::Json(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, CasketError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_kind() {
        let errors = [
            CasketError::LifecycleBlocked {
                token: "x".into(),
                reason: "disabled".into(),
            },
            CasketError::ChecksumMismatch {
                path: PathBuf::from("/tmp/x"),
                expected: "a".into(),
                actual: "b".into(),
            },
            CasketError::Fetch {
                token: "x".into(),
                url: "https://example.com".into(),
                kind: FetchErrorKind::Permanent,
                message: "404".into(),
            },
            CasketError::Install {
                token: "x".into(),
                step_index: 0,
                cause: "boom".into(),
            },
            CasketError::NotFound("x".into()),
        ];
        let mut codes: Vec<i32> = errors.iter().map(CasketError::exit_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(codes.iter().all(|c| *c != 0));
    }

    #[test]
    fn only_transient_fetch_errors_are_retryable() {
        let transient = CasketError::Fetch {
            token: "x".into(),
            url: "u".into(),
            kind: FetchErrorKind::Transient,
            message: "503".into(),
        };
        assert!(transient.is_transient());
        assert!(!CasketError::Generic("x".into()).is_transient());
    }
}
