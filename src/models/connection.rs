//! Connection-related data models.
//!
//! This module defines the dialect enum, the immutable capability record, the
//! per-client connection configuration, and transaction state types.

use crate::config::PoolOptions;
use serde::{Deserialize, Serialize};

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }

    /// Get the default port for this database type.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::PostgreSQL => Some(5432),
            Self::MySQL => Some(3306),
            Self::SQLite => None,
        }
    }

    /// Statement that opens a root transaction.
    ///
    /// SQLite takes the write lock up front so concurrent writers queue on
    /// the busy timeout instead of failing on lock upgrade.
    pub fn begin_statement(&self) -> &'static str {
        match self {
            Self::SQLite => "BEGIN IMMEDIATE",
            Self::PostgreSQL | Self::MySQL => "BEGIN",
        }
    }

    /// Quote an identifier (database, table, savepoint name).
    pub fn quote_identifier(&self, ident: &str) -> String {
        match self {
            Self::MySQL => format!("`{}`", ident.replace('`', "``")),
            Self::PostgreSQL | Self::SQLite => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    /// Whether `INSERT ... RETURNING` is available.
    pub fn supports_returning(&self) -> bool {
        !matches!(self, Self::MySQL)
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Dialect feature set attached to a client.
///
/// Defaults follow one rule: deficiencies are assumed absent, features are
/// assumed missing. Values can only be chosen through the consuming `with_*`
/// calls before the record is handed to a client; there is no way to change
/// it afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    dialect: DatabaseType,
    daemon: bool,
    safe_indexes: bool,
    requires_limit: bool,
    inline_comment: bool,
    pooling: bool,
}

impl Capabilities {
    /// Baseline capabilities for a dialect.
    pub fn for_dialect(dialect: DatabaseType) -> Self {
        let base = Self {
            dialect,
            daemon: true,
            safe_indexes: true,
            requires_limit: false,
            inline_comment: false,
            pooling: false,
        };
        match dialect {
            DatabaseType::PostgreSQL => base.with_pooling(true),
            DatabaseType::MySQL => base.with_pooling(true).with_requires_limit(true),
            DatabaseType::SQLite => Self { daemon: false, ..base }.with_requires_limit(true),
        }
    }

    pub fn with_safe_indexes(self, safe_indexes: bool) -> Self {
        Self {
            safe_indexes,
            ..self
        }
    }

    pub fn with_requires_limit(self, requires_limit: bool) -> Self {
        Self {
            requires_limit,
            ..self
        }
    }

    pub fn with_inline_comment(self, inline_comment: bool) -> Self {
        Self {
            inline_comment,
            ..self
        }
    }

    pub fn with_pooling(self, pooling: bool) -> Self {
        Self { pooling, ..self }
    }

    pub fn dialect(&self) -> DatabaseType {
        self.dialect
    }

    /// Whether the database runs as a separate server process.
    pub fn daemon(&self) -> bool {
        self.daemon
    }

    /// Supports `CREATE INDEX IF NOT EXISTS`.
    pub fn safe_indexes(&self) -> bool {
        self.safe_indexes
    }

    /// `OFFSET` only works together with `LIMIT`.
    pub fn requires_limit(&self) -> bool {
        self.requires_limit
    }

    pub fn inline_comment(&self) -> bool {
        self.inline_comment
    }

    pub fn pooling(&self) -> bool {
        self.pooling
    }
}

impl std::fmt::Display for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "dialect={} daemon={} safe_indexes={} requires_limit={} inline_comment={} pooling={}",
            self.dialect,
            self.daemon,
            self.safe_indexes,
            self.requires_limit,
            self.inline_comment,
            self.pooling
        )
    }
}

/// Configuration for one logical database client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Connection name used to look the client up.
    pub name: String,
    pub db_type: DatabaseType,
    /// Ignored for SQLite.
    pub host: String,
    /// Ignored for SQLite.
    pub port: u16,
    pub user: Option<String>,
    /// Contains sensitive data - never log
    #[serde(skip_serializing, default)]
    pub password: Option<String>,
    /// Database name, or the file path for SQLite.
    pub database: String,
    /// PostgreSQL search path applied to every new connection.
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub pool_options: PoolOptions,
}

impl ConnectionConfig {
    /// Create a new connection configuration.
    pub fn new(
        name: impl Into<String>,
        db_type: DatabaseType,
        database: impl Into<String>,
    ) -> Result<Self, ConnectionConfigError> {
        let name = name.into();
        let database = database.into();

        // Validate name
        if name.is_empty() {
            return Err(ConnectionConfigError::EmptyName);
        }
        if !name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConnectionConfigError::InvalidName(name));
        }
        if database.is_empty() {
            return Err(ConnectionConfigError::MissingDatabase);
        }

        Ok(Self {
            name,
            db_type,
            host: "localhost".to_string(),
            port: db_type.default_port().unwrap_or_default(),
            user: None,
            password: None,
            database,
            schema: None,
            pool_options: PoolOptions::default(),
        })
    }

    pub fn with_host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: Option<String>) -> Self {
        self.user = Some(user.into());
        self.password = password;
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_pool_options(mut self, pool_options: PoolOptions) -> Self {
        self.pool_options = pool_options;
        self
    }

    /// Get a display-safe rendering of the target (credentials masked).
    pub fn masked_url(&self) -> String {
        match self.db_type {
            DatabaseType::SQLite => format!("sqlite:{}", self.database),
            DatabaseType::PostgreSQL | DatabaseType::MySQL => {
                let scheme = match self.db_type {
                    DatabaseType::PostgreSQL => "postgres",
                    _ => "mysql",
                };
                let credentials = match (&self.user, &self.password) {
                    (Some(user), Some(_)) => format!("{}:****@", user),
                    (Some(user), None) => format!("{}@", user),
                    (None, _) => String::new(),
                };
                format!(
                    "{}://{}{}:{}/{}",
                    scheme, credentials, self.host, self.port, self.database
                )
            }
        }
    }
}

/// Errors that can occur when creating a connection configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionConfigError {
    #[error("Connection name cannot be empty")]
    EmptyName,

    #[error("Connection name contains invalid characters: {0}")]
    InvalidName(String),

    #[error("Unknown database type in connection string: {0}")]
    UnknownDatabaseType(String),

    #[error("Connection string does not name a database")]
    MissingDatabase,

    #[error("Invalid connection string: {0}")]
    InvalidUrl(String),

    #[error("Invalid connection option: {0}")]
    InvalidOption(String),
}

impl From<ConnectionConfigError> for crate::error::DbError {
    fn from(err: ConnectionConfigError) -> Self {
        crate::error::DbError::configuration(err.to_string())
    }
}

/// Lifecycle state of a transaction scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    /// Constructed, no connection pinned yet.
    Created,
    Started,
    Committed,
    RolledBack,
    /// Connection released and registry restored.
    Finalized,
}

impl TransactionState {
    /// Check if the transaction accepts statements.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Started)
    }

    /// Check if a terminating command has been issued or the scope is closed.
    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Finalized)
    }
}

/// Snapshot of a transaction scope for logging and inspection.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionInfo {
    pub id: String,
    pub connection_name: String,
    /// 0 for a root scope.
    pub depth: usize,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub state: TransactionState,
}
