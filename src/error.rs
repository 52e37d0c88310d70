//! Error types for scoped-db.
//!
//! All fallible operations return [`DbError`]. Driver errors pass through the
//! translation boundary in [`translate`], which normalizes syntax/permission
//! failures and constraint violations and leaves everything else untouched.

use sqlx::error::{DatabaseError, ErrorKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    /// The target database could not be reached or created.
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    /// Malformed statement, permission failure, or transaction API misuse.
    #[error("Operational error: {message}")]
    Operational {
        message: String,
        /// e.g., "42601" for a syntax error
        sql_state: Option<String>,
    },

    #[error("Integrity error: {message}")]
    Integrity {
        message: String,
        /// e.g., "23505" for a unique violation
        sql_state: Option<String>,
    },

    /// Operation on a transaction scope that has already been finalized.
    #[error("Transaction management error: {message} (transaction: {transaction_id})")]
    TransactionManagement {
        message: String,
        transaction_id: String,
    },

    #[error("Timeout: {operation} exceeded {timeout_secs}s")]
    Timeout { operation: String, timeout_secs: u64 },

    #[error("Connection not found: {connection_name}")]
    ConnectionNotFound { connection_name: String },

    #[error("Invalid parameters: {message}")]
    Params { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Driver error outside the normalized categories, propagated as-is.
    #[error("Database error: {0}")]
    Driver(#[source] sqlx::Error),
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create an operational error with optional SQL state.
    pub fn operational(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Operational {
            message: message.into(),
            sql_state,
        }
    }

    /// Create an integrity error with optional SQL state.
    pub fn integrity(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Integrity {
            message: message.into(),
            sql_state,
        }
    }

    /// Create a transaction management error.
    pub fn transaction_management(
        message: impl Into<String>,
        transaction_id: impl Into<String>,
    ) -> Self {
        Self::TransactionManagement {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, timeout_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_secs,
        }
    }

    /// Create a connection not found error.
    pub fn connection_not_found(connection_name: impl Into<String>) -> Self {
        Self::ConnectionNotFound {
            connection_name: connection_name.into(),
        }
    }

    /// Create a parameter error.
    pub fn params(message: impl Into<String>) -> Self {
        Self::Params {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// SQLSTATE (or SQLite result code) reported by the driver.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Operational { sql_state, .. } | Self::Integrity { sql_state, .. } => {
                sql_state.as_deref()
            }
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// True for errors raised by a scope that is already finalized.
    ///
    /// Scope exit logic uses this to finalize without issuing a second
    /// terminating command.
    pub fn is_transaction_management(&self) -> bool {
        matches!(self, Self::TransactionManagement { .. })
    }
}

/// Translate a driver error at the statement-execution boundary.
///
/// Syntax and access-rule failures become [`DbError::Operational`], constraint
/// violations become [`DbError::Integrity`]. Timeouts and cancellation are
/// never mapped to either category.
pub fn translate(err: sqlx::Error) -> DbError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned());
            if is_integrity_violation(&*db_err, code.as_deref()) {
                DbError::integrity(db_err.message(), code)
            } else if is_syntax_or_access(code.as_deref()) {
                DbError::operational(db_err.message(), code)
            } else {
                DbError::Driver(sqlx::Error::Database(db_err))
            }
        }
        sqlx::Error::PoolClosed => {
            DbError::connection("Connection pool is closed", "Create the connection again")
        }
        other => DbError::Driver(other),
    }
}

/// SQLite primary result codes that indicate a bad statement or a denied
/// operation: SQLITE_ERROR, SQLITE_PERM, SQLITE_READONLY, SQLITE_AUTH.
const SQLITE_SYNTAX_OR_ACCESS: [u32; 4] = [1, 3, 8, 23];

const SQLITE_CONSTRAINT: u32 = 19;

fn is_integrity_violation(db_err: &dyn DatabaseError, code: Option<&str>) -> bool {
    if !matches!(db_err.kind(), ErrorKind::Other) {
        return true;
    }
    match classify_code(code) {
        Some(ResultCode::SqlState(state)) => state.starts_with("23"),
        Some(ResultCode::Sqlite(primary)) => primary == SQLITE_CONSTRAINT,
        None => false,
    }
}

fn is_syntax_or_access(code: Option<&str>) -> bool {
    match classify_code(code) {
        Some(ResultCode::SqlState(state)) => state.starts_with("42"),
        Some(ResultCode::Sqlite(primary)) => SQLITE_SYNTAX_OR_ACCESS.contains(&primary),
        None => false,
    }
}

enum ResultCode<'a> {
    SqlState(&'a str),
    /// Primary code (low byte of the extended result code).
    Sqlite(u32),
}

/// SQLSTATE values are always five characters; SQLite reports its numeric
/// extended result code instead.
fn classify_code(code: Option<&str>) -> Option<ResultCode<'_>> {
    let code = code?;
    if code.len() == 5 {
        return Some(ResultCode::SqlState(code));
    }
    code.parse::<u32>()
        .ok()
        .map(|extended| ResultCode::Sqlite(extended & 0xff))
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        translate(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::connection("refused", "Check that the server is running");
        assert_eq!(err.suggestion(), Some("Check that the server is running"));
        assert_eq!(DbError::params("x").suggestion(), None);
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("query", 30).is_retryable());
        assert!(DbError::connection("err", "sugg").is_retryable());
        assert!(!DbError::operational("bad", None).is_retryable());
    }

    #[test]
    fn test_transaction_management_flag() {
        assert!(DbError::transaction_management("finalized", "tx_1").is_transaction_management());
        assert!(!DbError::operational("nope", None).is_transaction_management());
    }

    #[test]
    fn test_sql_state_accessor() {
        let err = DbError::integrity("dup", Some("23505".to_string()));
        assert_eq!(err.sql_state(), Some("23505"));
        assert_eq!(DbError::params("x").sql_state(), None);
    }

    #[test]
    fn test_classify_sqlstate() {
        assert!(is_syntax_or_access(Some("42601")));
        assert!(is_syntax_or_access(Some("42501")));
        assert!(is_syntax_or_access(Some("42S02")));
        assert!(!is_syntax_or_access(Some("23505")));
        assert!(!is_syntax_or_access(Some("40001")));
    }

    #[test]
    fn test_classify_sqlite_codes() {
        assert!(is_syntax_or_access(Some("1")));
        assert!(is_syntax_or_access(Some("8")));
        // SQLITE_BUSY is neither a syntax nor an access failure
        assert!(!is_syntax_or_access(Some("5")));
        // SQLITE_CONSTRAINT_UNIQUE shares the SQLITE_CONSTRAINT primary code
        assert!(matches!(
            classify_code(Some("2067")),
            Some(ResultCode::Sqlite(SQLITE_CONSTRAINT))
        ));
    }

    #[test]
    fn test_unclassified_errors_pass_through() {
        let err = translate(sqlx::Error::RowNotFound);
        assert!(matches!(err, DbError::Driver(sqlx::Error::RowNotFound)));

        let err = translate(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, DbError::Driver(sqlx::Error::PoolTimedOut)));
    }

    #[test]
    fn test_pool_closed_is_connection_error() {
        let err = translate(sqlx::Error::PoolClosed);
        assert!(matches!(err, DbError::Connection { .. }));
    }
}
