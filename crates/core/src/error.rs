//! Error types for isodb
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! The variants follow the failure taxonomy of the isolation layer:
//! - Configuration errors abort only the affected test
//! - Access errors are programming-usage signals, never retried
//! - Provisioning errors are fatal to the whole session
//! - Teardown errors are downgraded to session warnings by the caller

use std::io;
use thiserror::Error;

/// Result type alias for isodb operations
pub type IsoResult<T> = std::result::Result<T, IsoError>;

/// Message raised when a test touches the database without opting in.
pub const ACCESS_BLOCKED_MESSAGE: &str = "Database access not allowed, use the \"django_db\" mark, \
     or the \"db\" or \"transactional_db\" fixtures to enable it.";

/// Error types for isodb
#[derive(Debug, Error)]
pub enum IsoError {
    /// Invalid mark arguments, malformed addresses, unknown aliases, fixtures not requested
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Database touched while the access blocker is engaged
    #[error("{}", ACCESS_BLOCKED_MESSAGE)]
    AccessBlocked,

    /// Database touched from a thread that does not own the unblocked gate
    #[error("Database access is only allowed in the main thread (attempted from thread '{thread}')")]
    NotMainThread {
        /// Name (or id) of the offending thread
        thread: String,
    },

    /// Database touched for an alias outside the test's `databases`
    #[error(
        "Database queries to '{alias}' are not allowed in this test. Add '{alias}' to the \
         django_db mark's databases to ensure proper test isolation and silence this failure."
    )]
    AliasNotAllowed {
        /// Alias that was touched
        alias: String,
    },

    /// Test database creation, schema application or snapshot capture failed
    #[error("Failed to set up test database for alias '{alias}': {message}")]
    Provisioning {
        /// Alias being provisioned
        alias: String,
        /// Underlying failure
        message: String,
    },

    /// Teardown of a test database or isolation wrapper failed
    #[error("Error when trying to teardown test databases: {0}")]
    Teardown(String),

    /// Live server failed to start or stopped unexpectedly
    #[error("Live server error: {0}")]
    LiveServer(String),

    /// Error reported by the database backend
    #[error("Database error ({vendor}): {message}")]
    Database {
        /// Backend vendor name
        vendor: &'static str,
        /// Backend message
        message: String,
    },

    /// Requested isolation mode or feature is not available on this backend
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Query-count assertion failed
    #[error("{0}")]
    QueryCount(String),

    /// Serialization/deserialization error (snapshots, config files)
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid operation or state (e.g. unbalanced blocker restore)
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// I/O error (file operations, sockets)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl IsoError {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        IsoError::Configuration(msg.into())
    }

    /// Create an invalid-operation error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        IsoError::InvalidOperation(msg.into())
    }

    /// Create a provisioning error for an alias
    pub fn provisioning(alias: impl Into<String>, msg: impl Into<String>) -> Self {
        IsoError::Provisioning {
            alias: alias.into(),
            message: msg.into(),
        }
    }

    /// Create a backend error
    pub fn database(vendor: &'static str, msg: impl Into<String>) -> Self {
        IsoError::Database {
            vendor,
            message: msg.into(),
        }
    }

    /// Create an unsupported-feature error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        IsoError::Unsupported(msg.into())
    }

    /// True for errors caused by the access blocker or the alias gate
    pub fn is_access_error(&self) -> bool {
        matches!(
            self,
            IsoError::AccessBlocked | IsoError::NotMainThread { .. } | IsoError::AliasNotAllowed { .. }
        )
    }
}

impl From<serde_json::Error> for IsoError {
    fn from(e: serde_json::Error) -> Self {
        IsoError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_blocked_names_the_opt_in() {
        let msg = IsoError::AccessBlocked.to_string();
        assert!(msg.contains("django_db"));
        assert!(msg.contains("transactional_db"));
    }

    #[test]
    fn test_not_main_thread_is_distinct() {
        let msg = IsoError::NotMainThread {
            thread: "worker".to_string(),
        }
        .to_string();
        assert!(msg.contains("only allowed in the main thread"));
        assert!(msg.contains("worker"));
        assert_ne!(msg, IsoError::AccessBlocked.to_string());
    }

    #[test]
    fn test_alias_not_allowed_names_alias() {
        let msg = IsoError::AliasNotAllowed {
            alias: "replica".to_string(),
        }
        .to_string();
        assert!(msg.contains("'replica'"));
        assert!(msg.contains("databases"));
    }

    #[test]
    fn test_provisioning_display() {
        let err = IsoError::provisioning("default", "permission denied");
        let msg = err.to_string();
        assert!(msg.contains("default"));
        assert!(msg.contains("permission denied"));
    }

    #[test]
    fn test_is_access_error() {
        assert!(IsoError::AccessBlocked.is_access_error());
        assert!(IsoError::AliasNotAllowed {
            alias: "x".to_string()
        }
        .is_access_error());
        assert!(!IsoError::configuration("bad").is_access_error());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::AddrInUse, "in use");
        let err: IsoError = io_err.into();
        assert!(matches!(err, IsoError::Io(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let result: IsoResult<serde_json::Value> =
            serde_json::from_str("{not json").map_err(IsoError::from);
        assert!(matches!(result, Err(IsoError::Serialization(_))));
    }
}
