//! Error types for the dirsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("required environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing { var: String, field: String },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ConfigError {
    /// Shorthand for [`ConfigError::InvalidValue`].
    pub fn invalid(field: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            detail: detail.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Directory errors
// ---------------------------------------------------------------------------

/// Errors from the directory client and its transports.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// No endpoint URIs were configured.
    #[error("no directory endpoints configured")]
    NoEndpoints,

    /// Connecting to or binding against one endpoint failed.
    #[error("bind to '{uri}' failed: {detail}")]
    BindFailed { uri: String, detail: String },

    /// A search on a bound session failed.
    #[error("search on '{uri}' failed: {detail}")]
    SearchFailed { uri: String, detail: String },

    /// Every endpoint in the failover list was tried without success.
    #[error("all {tried} directory endpoint(s) failed; last error: {last_error}")]
    AllEndpointsFailed { tried: usize, last_error: String },

    /// The TLS connector could not be built.
    #[error("TLS setup failed: {0}")]
    Tls(String),
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

/// Errors from the identity and cursor stores.
///
/// Constraint and data violations are kept apart from other failures so the
/// reconcilers can treat them as per-record problems.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness, foreign key or check constraint rejected the write.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// A value could not be stored or read back in the expected shape.
    #[error("invalid data: {0}")]
    Data(String),

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// Underlying rusqlite error that is not a constraint or data problem.
    #[error("database error: {0}")]
    Sqlite(rusqlite::Error),

    /// JSON column encoding failed.
    #[error("field map serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl StoreError {
    /// Whether the error concerns the record being written rather than the
    /// store as a whole.
    pub fn is_record_level(&self) -> bool {
        matches!(self, Self::Constraint(_) | Self::Data(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &err {
            rusqlite::Error::SqliteFailure(inner, _)
                if inner.code == ErrorCode::ConstraintViolation =>
            {
                Self::Constraint(err.to_string())
            }
            rusqlite::Error::SqliteFailure(inner, _)
                if matches!(inner.code, ErrorCode::TooBig | ErrorCode::TypeMismatch) =>
            {
                Self::Data(err.to_string())
            }
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::IntegralValueOutOfRange(..)
            | rusqlite::Error::InvalidColumnType(..) => Self::Data(err.to_string()),
            _ => Self::Sqlite(err),
        }
    }
}

// ---------------------------------------------------------------------------
// Blob errors
// ---------------------------------------------------------------------------

/// Errors from the blob store used for photo attributes.
#[derive(Debug, Error)]
pub enum BlobError {
    /// The blob name is empty or escapes the store root.
    #[error("invalid blob name '{0}'")]
    InvalidName(String),

    /// Filesystem error.
    #[error("blob I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Sync engine errors
// ---------------------------------------------------------------------------

/// Errors that abort a sync run.
///
/// Record-level failures never surface here; they only move counters.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another run is already in progress in this process.
    #[error("a sync run is already in progress")]
    AlreadyRunning,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// CoreError implements `std::error::Error` via `thiserror`, so the binaries
// can use `?` into `anyhow::Error` directly.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = ConfigError::EnvVarMissing {
            var: "DIRSYNC_BIND_PASSWORD".into(),
            field: "directory.bind_password_env".into(),
        };
        assert!(err.to_string().contains("DIRSYNC_BIND_PASSWORD"));

        let err = ConfigError::invalid("users.attributes", "must not be empty");
        assert_eq!(
            err.to_string(),
            "invalid configuration value for 'users.attributes': must not be empty"
        );

        let err = DirectoryError::AllEndpointsFailed {
            tried: 2,
            last_error: "connection refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "all 2 directory endpoint(s) failed; last error: connection refused"
        );

        let err = BlobError::InvalidName("../etc/passwd".into());
        assert!(err.to_string().contains("../etc/passwd"));
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let err: CoreError = DirectoryError::NoEndpoints.into();
        assert!(matches!(err, CoreError::Directory(_)));

        let err: CoreError = SyncError::AlreadyRunning.into();
        assert!(matches!(err, CoreError::Sync(_)));
    }

    #[test]
    fn test_sync_error_wraps_config_error() {
        let err: SyncError = ConfigError::invalid("groups.removal_action", "only 'keep'").into();
        assert!(matches!(err, SyncError::Config(ConfigError::InvalidValue { .. })));
        assert!(err.to_string().contains("groups.removal_action"));
    }

    #[test]
    fn test_store_error_classifies_constraint_violation() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (name TEXT NOT NULL UNIQUE);")
            .unwrap();
        conn.execute("INSERT INTO t (name) VALUES ('a')", []).unwrap();
        let err: StoreError = conn
            .execute("INSERT INTO t (name) VALUES ('a')", [])
            .unwrap_err()
            .into();
        assert!(matches!(err, StoreError::Constraint(_)));
        assert!(err.is_record_level());
    }

    #[test]
    fn test_store_error_other_failures_are_not_record_level() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err: StoreError = conn
            .execute("INSERT INTO missing_table VALUES (1)", [])
            .unwrap_err()
            .into();
        assert!(matches!(err, StoreError::Sqlite(_)));
        assert!(!err.is_record_level());
    }
}
