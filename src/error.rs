use thiserror::Error;

use crate::auth::AuthError;
use crate::backend::BackendError;
use crate::crypter::{CrypterError, KeyFileError};
use crate::store::StoreError;
use crate::transport::TransportError;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Key file error: {0}")]
    KeyFile(#[from] KeyFileError),

    #[error("Crypter error: {0}")]
    Crypter(#[from] CrypterError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Authorization error: {0}")]
    Auth(#[from] AuthError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command exited with status {0}")]
    CommandFailed(u32),

    #[error("{0}")]
    Usage(String),
}

impl AppError {
    pub fn usage<S: Into<String>>(msg: S) -> Self {
        Self::Usage(msg.into())
    }

    /// Process exit status for this error.
    ///
    /// Remote command failures pass their own status through; usage and
    /// configuration problems exit with 2, everything else with 1.
    pub fn exit_status(&self) -> i32 {
        match self {
            Self::CommandFailed(status) => i32::try_from(*status).unwrap_or(1).max(1),
            Self::Usage(_) | Self::Config(_) => 2,
            _ => 1,
        }
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status() {
        assert_eq!(AppError::CommandFailed(3).exit_status(), 3);
        assert_eq!(AppError::CommandFailed(0).exit_status(), 1);
        assert_eq!(AppError::CommandFailed(u32::MAX).exit_status(), 1);
        assert_eq!(AppError::usage("missing NAME").exit_status(), 2);
        assert_eq!(AppError::Transport(TransportError::Unauthorized).exit_status(), 1);
    }

    #[test]
    fn test_messages() {
        let err: AppError = BackendError::UnknownKind("etcd".to_string()).into();
        assert_eq!(
            err.to_string(),
            "Backend error: Backend \"etcd\" has not been implemented"
        );
    }
}
