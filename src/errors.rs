//! Crate-wide error type and the severity-to-exit-code mapping used by the CLI entry point.

use thiserror::Error;

/// Severity levels mirroring the logger's; the process exit code equals the
/// severity of the most severe error surfaced to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error = 1,
    Fatal = 2,
    Panic = 3,
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Codec(#[from] bincode::error::EncodeError),

    #[error("deserialization error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("manifest JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("operation interrupted")]
    Interrupted,
}

impl BackupError {
    /// Severity used to compute the CLI's exit code.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::Config(_) => Severity::Fatal,
            Self::Interrupted => Severity::Fatal,
            Self::Io(_) | Self::Codec(_) | Self::Decode(_) | Self::Json(_) => Severity::Error,
            Self::Validation(_) | Self::Lock(_) | Self::Catalog(_) => Severity::Error,
        }
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.severity() as i32
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_is_fatal() {
        assert_eq!(BackupError::Config("x".into()).severity(), Severity::Fatal);
        assert_eq!(BackupError::Config("x".into()).exit_code(), 2);
    }

    #[test]
    fn validation_error_is_error_severity() {
        assert_eq!(BackupError::Validation("x".into()).severity(), Severity::Error);
        assert_eq!(BackupError::Validation("x".into()).exit_code(), 1);
    }
}
