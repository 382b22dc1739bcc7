use thiserror::Error;

/// Main error type for the decision core
#[derive(Error, Debug)]
pub enum AutotraderError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    // Selection errors
    #[error("No eligible arm for current context")]
    NoEligibleArm,

    #[error("Unknown arm: {0}")]
    UnknownArm(String),

    #[error("Unknown open trade: {0}")]
    UnknownTrade(String),

    // Walk-forward errors
    #[error("Leakage violation: {0}")]
    LeakageViolation(String),

    #[error("Strategy evaluation failed: {strategy} - {reason}")]
    Evaluation { strategy: String, reason: String },

    // Persistence errors
    #[error("Duplicate key: {table}({key})")]
    DuplicateKey { table: &'static str, key: String },

    #[error("Row is final: {table}({key})")]
    FinalRow { table: &'static str, key: String },

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Data errors
    #[error("Invalid market data: {0}")]
    InvalidMarketData(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AutotraderError {
    /// Whether a retry of the same persistence call could succeed.
    ///
    /// Duplicate keys and malformed payloads are permanent; connection-level
    /// database errors are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            AutotraderError::PersistenceFailure(_) | AutotraderError::Io(_) => true,
            AutotraderError::Database(e) => !matches!(
                e,
                sqlx::Error::Database(_) | sqlx::Error::RowNotFound | sqlx::Error::ColumnDecode { .. }
            ),
            _ => false,
        }
    }
}

/// Result type alias for AutotraderError
pub type Result<T> = std::result::Result<T, AutotraderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_key_is_permanent() {
        let err = AutotraderError::DuplicateKey {
            table: "equity_curve",
            key: "2024-01-01T00:00:00Z".to_string(),
        };
        assert!(!err.is_transient());
        assert_eq!(
            err.to_string(),
            "Duplicate key: equity_curve(2024-01-01T00:00:00Z)"
        );
    }

    #[test]
    fn test_persistence_failure_is_transient() {
        let err = AutotraderError::PersistenceFailure("connection reset".to_string());
        assert!(err.is_transient());
        assert!(!AutotraderError::NoEligibleArm.is_transient());
    }
}
