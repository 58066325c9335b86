//! Error kinds surfaced by a replication pass.
//!
//! | Kind | Scope of failure |
//! |------|------------------|
//! | `SourceUnavailable` | the replication set's current pass |
//! | `RetentionExceeded` | one destination group, not retried automatically |
//! | `DestinationUnavailable` | one destination, retried next pass |
//! | `ApplyFailed` | one destination's transaction, rolled back |
//! | `Config` | the configuration file |

use crate::change::Version;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// The source could not be reached or queried.
    #[error("Source database {database} is unavailable: {message}")]
    SourceUnavailable { database: String, message: String },

    /// A destination's watermark is older than the table's tracked history.
    #[error(
        "Cannot replicate table {table} to {} because minimum source version {min_valid_version} is greater than destination version {watermark}",
        .destinations.join(", ")
    )]
    RetentionExceeded {
        table: String,
        min_valid_version: Version,
        watermark: Version,
        destinations: Vec<String>,
    },

    /// A destination could not be reached or its watermark could not be read.
    #[error("Destination database {database} is unavailable: {message}")]
    DestinationUnavailable { database: String, message: String },

    /// A statement failed while applying changes; the transaction was rolled back.
    #[error("Error replicating changes to destination {database}: {message}")]
    ApplyFailed { database: String, message: String },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn source_unavailable(database: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::SourceUnavailable {
            database: database.into(),
            message: format!("{err:#}"),
        }
    }

    pub fn destination_unavailable(database: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::DestinationUnavailable {
            database: database.into(),
            message: format!("{err:#}"),
        }
    }

    pub fn apply_failed(database: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::ApplyFailed {
            database: database.into(),
            message: format!("{err:#}"),
        }
    }

    /// Whether the next scheduled pass may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SourceUnavailable { .. } => true,
            Self::DestinationUnavailable { .. } => true,
            Self::ApplyFailed { .. } => true,
            Self::RetentionExceeded { .. } => false,
            Self::Config(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retention_exceeded_message() {
        let err = SyncError::RetentionExceeded {
            table: "public.users".to_string(),
            min_valid_version: 12,
            watermark: 3,
            destinations: vec!["replica-a".to_string(), "replica-b".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("public.users"));
        assert!(msg.contains("replica-a, replica-b"));
        assert!(msg.contains("12"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_constructors_keep_context() {
        let err = SyncError::destination_unavailable("replica", "connection refused");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("replica"));
        assert!(err.to_string().contains("connection refused"));

        let err = SyncError::apply_failed("replica", "duplicate key");
        assert!(err.to_string().contains("duplicate key"));
    }

    #[test]
    fn test_config_not_retryable() {
        assert!(!SyncError::Config("no destinations".to_string()).is_retryable());
    }
}
