//! Error types for the directory identity provider

use std::io;

use thiserror::Error;

use crate::directory::DirectoryError;

/// Result type alias for dirgate
pub type Result<T> = std::result::Result<T, Error>;

/// dirgate errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (bad filter template, unparseable URL, missing mapping)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Directory could not be queried
    #[error("Lookup failed: {0}")]
    Lookup(#[source] DirectoryError),

    /// Credentials were rejected
    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),

    /// The owning provider configuration was removed or replaced
    #[error("Provider configuration is stale: {0}")]
    StaleProvider(String),

    /// Certificate could not be decoded
    #[error("Invalid certificate: {0}")]
    Certificate(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying later could succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Lookup(e) if e.is_transient())
    }
}

impl From<DirectoryError> for Error {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::InvalidFilter(msg) => Self::Config(msg),
            other => Self::Lookup(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_filter_becomes_config_error() {
        let err: Error = DirectoryError::InvalidFilter("unbalanced".into()).into();
        assert!(matches!(err, Error::Config(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn unavailable_directory_is_transient() {
        let err: Error = DirectoryError::Unavailable("connection refused".into()).into();
        assert!(err.is_transient());
        assert_eq!(
            err.to_string(),
            "Lookup failed: Directory unavailable: connection refused"
        );
    }

    #[test]
    fn rejected_bind_is_not_transient() {
        let err: Error = DirectoryError::AuthenticationFailed("bad password".into()).into();
        assert!(!err.is_transient());
    }
}
