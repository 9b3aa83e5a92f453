//! Error types for the refresh library.

use thiserror::Error;

/// Exit code for configuration errors (bad YAML, unknown table, validation).
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for connection and query failures.
pub const EXIT_DATABASE_ERROR: u8 = 2;
/// Exit code for partition boundary or switch failures.
pub const EXIT_PARTITION_ERROR: u8 = 3;
/// Exit code when one or more tables in a batch run failed.
pub const EXIT_REFRESH_FAILED: u8 = 4;
/// Exit code for file system errors.
pub const EXIT_IO_ERROR: u8 = 7;

/// Main error type for refresh operations.
#[derive(Error, Debug)]
pub enum RefreshError {
    /// Configuration error (invalid YAML, unknown table, failed validation).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database driver error.
    #[error("Database error: {0}")]
    Database(#[from] tiberius::error::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// A statement against a specific table failed.
    #[error("Query failed for table {table}: {message}")]
    Query { table: String, message: String },

    /// Partition boundary creation or partition switch failed.
    #[error("Partition operation failed for table {table}: {message}")]
    Partition { table: String, message: String },

    /// One or more tables in a batch run ended with `error` status.
    #[error("Refresh failed for tables: {0}")]
    RefreshFailed(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RefreshError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        RefreshError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Query error
    pub fn query(table: impl Into<String>, message: impl Into<String>) -> Self {
        RefreshError::Query {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Partition error
    pub fn partition(table: impl Into<String>, message: impl Into<String>) -> Self {
        RefreshError::Partition {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Process exit code for this error category.
    pub fn exit_code(&self) -> u8 {
        match self {
            RefreshError::Config(_) | RefreshError::Yaml(_) => EXIT_CONFIG_ERROR,
            RefreshError::Database(_) | RefreshError::Pool { .. } | RefreshError::Query { .. } => {
                EXIT_DATABASE_ERROR
            }
            RefreshError::Partition { .. } => EXIT_PARTITION_ERROR,
            RefreshError::RefreshFailed(_) => EXIT_REFRESH_FAILED,
            RefreshError::Io(_) => EXIT_IO_ERROR,
            RefreshError::Json(_) => EXIT_CONFIG_ERROR,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for refresh operations.
pub type Result<T> = std::result::Result<T, RefreshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_by_category() {
        assert_eq!(RefreshError::Config("x".into()).exit_code(), EXIT_CONFIG_ERROR);
        assert_eq!(RefreshError::query("t", "boom").exit_code(), EXIT_DATABASE_ERROR);
        assert_eq!(
            RefreshError::partition("t", "split failed").exit_code(),
            EXIT_PARTITION_ERROR
        );
        assert_eq!(
            RefreshError::RefreshFailed("a, b".into()).exit_code(),
            EXIT_REFRESH_FAILED
        );
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert_eq!(RefreshError::from(io).exit_code(), EXIT_IO_ERROR);
    }

    #[test]
    fn test_format_detailed_includes_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "config.yaml");
        let err = RefreshError::from(io);
        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: IO error: config.yaml"));
    }

    #[test]
    fn test_partition_error_message() {
        let err = RefreshError::partition("DailyReports", "split range 20250207 failed");
        assert_eq!(
            err.to_string(),
            "Partition operation failed for table DailyReports: split range 20250207 failed"
        );
    }
}
