//! Database client.
//!
//! A [`Client`] is one logical database target. It owns the pool, a
//! transaction registry and the statement executor, and routes every data
//! operation through [`Client::current_source`]: the pinned connection of the
//! calling task's transaction when there is one, a pooled connection for the
//! single call otherwise.

use crate::config::DatabaseConfig;
use crate::db::executor::StatementExecutor;
use crate::db::pool::{DatabaseTarget, DbConnection, DbPool, PoolStatus, ScopedConnection};
use crate::db::transaction::{PinnedGuard, TransactionScope};
use crate::db::transaction_registry::TransactionRegistry;
use crate::error::{DbError, DbResult};
use crate::models::{
    Capabilities, ConnectionConfig, DatabaseType, GeneratedFields, InsertResult, Row, Value,
};
use sqlx::mysql::MySqlDatabaseError;
use std::fmt;
use std::future::Future;
use std::io::ErrorKind;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// PostgreSQL: invalid catalog name.
const PG_UNDEFINED_DATABASE: &str = "3D000";
/// MySQL: can't drop database; database doesn't exist.
const MYSQL_DROP_MISSING_DATABASE: u16 = 1008;

struct ClientInner {
    config: ConnectionConfig,
    capabilities: Arc<Capabilities>,
    pool: RwLock<Option<DbPool>>,
    registry: TransactionRegistry,
    executor: StatementExecutor,
    active_transactions: AtomicUsize,
}

/// Handle to one configured database. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.inner.config.name)
            .field("db_type", &self.inner.config.db_type)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client with the default capabilities of its dialect.
    ///
    /// No connection is opened until the first operation.
    pub fn new(config: ConnectionConfig) -> DbResult<Self> {
        let capabilities = Capabilities::for_dialect(config.db_type);
        Self::with_capabilities(config, capabilities)
    }

    pub fn with_capabilities(
        config: ConnectionConfig,
        capabilities: Capabilities,
    ) -> DbResult<Self> {
        config
            .pool_options
            .validate()
            .map_err(DbError::configuration)?;
        if capabilities.dialect() != config.db_type {
            return Err(DbError::configuration(format!(
                "Capabilities for {} cannot be used with a {} connection",
                capabilities.dialect(),
                config.db_type
            )));
        }

        let executor = StatementExecutor::new(config.pool_options.statement_timeout());
        Ok(Self {
            inner: Arc::new(ClientInner {
                registry: TransactionRegistry::new(&config.name),
                capabilities: Arc::new(capabilities),
                pool: RwLock::new(None),
                executor,
                active_transactions: AtomicUsize::new(0),
                config,
            }),
        })
    }

    /// Create a client from a connection URL, see [`DatabaseConfig::parse`].
    pub fn from_url(name: Option<&str>, url: &str) -> DbResult<Self> {
        Self::new(DatabaseConfig::from_url(name, url)?)
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.inner.capabilities
    }

    pub fn db_type(&self) -> DatabaseType {
        self.inner.config.db_type
    }

    pub(crate) fn registry(&self) -> &TransactionRegistry {
        &self.inner.registry
    }

    pub(crate) fn executor(&self) -> &StatementExecutor {
        &self.inner.executor
    }

    // =========================================================================
    // Pool lifecycle
    // =========================================================================

    /// Create the pool if it does not exist yet.
    ///
    /// With `with_database == false` the pool connects to the server without
    /// selecting the configured database, for creating or dropping it. When
    /// a pool already exists this is a no-op.
    pub async fn create_connection(&self, with_database: bool) -> DbResult<()> {
        let target = if with_database {
            DatabaseTarget::Database
        } else {
            DatabaseTarget::Server
        };
        self.ensure_pool(target).await.map(|_| ())
    }

    /// The client's pool, created on first use.
    pub(crate) async fn pool(&self) -> DbResult<DbPool> {
        self.ensure_pool(DatabaseTarget::Database).await
    }

    async fn ensure_pool(&self, target: DatabaseTarget) -> DbResult<DbPool> {
        if let Some(pool) = self.inner.pool.read().await.as_ref() {
            return Ok(pool.clone());
        }

        let mut slot = self.inner.pool.write().await;
        // Double-check after acquiring write lock
        if let Some(pool) = slot.as_ref() {
            return Ok(pool.clone());
        }
        let pool = DbPool::connect(&self.inner.config, target).await?;
        *slot = Some(pool.clone());
        Ok(pool)
    }

    /// Pool size, or `None` before the pool exists.
    pub async fn pool_status(&self) -> Option<PoolStatus> {
        self.inner.pool.read().await.as_ref().map(DbPool::status)
    }

    /// Close the pool, waiting up to the configured close timeout.
    ///
    /// Returns `false` when connections were still borrowed after the grace
    /// period. Those connections are terminated: running statements are
    /// aborted and open transactions fail with [`DbError::Connection`] on
    /// their next operation. The next operation creates a fresh pool.
    pub async fn close(&self) -> bool {
        let pool = self.inner.pool.write().await.take();
        match pool {
            Some(pool) => {
                pool.close(self.inner.config.pool_options.close_timeout())
                    .await
            }
            None => true,
        }
    }

    /// Borrow a pooled connection for one operation, bypassing any current
    /// transaction.
    pub async fn acquire_connection(&self) -> DbResult<ScopedConnection> {
        let pool = self.pool().await?;
        ScopedConnection::acquire(&pool, self.name()).await
    }

    // =========================================================================
    // Routing
    // =========================================================================

    pub fn current_transaction(&self) -> Option<TransactionScope> {
        self.inner.registry.current()
    }

    /// Where data operations of the calling task run right now.
    pub fn current_source(&self) -> ConnectionSource {
        match self.current_transaction() {
            Some(scope) => ConnectionSource::Transaction(scope),
            None => ConnectionSource::Client(self.clone()),
        }
    }

    pub async fn execute_insert(&self, command: &str, values: &[Value]) -> DbResult<Option<Row>> {
        self.current_source().execute_insert(command, values).await
    }

    pub async fn execute_many(&self, command: &str, rows: &[Vec<Value>]) -> DbResult<()> {
        self.current_source().execute_many(command, rows).await
    }

    pub async fn execute_query(&self, command: &str) -> DbResult<Vec<Row>> {
        self.current_source().execute_query(command).await
    }

    pub async fn execute_query_with(&self, command: &str, values: &[Value]) -> DbResult<Vec<Row>> {
        self.current_source()
            .execute_query_with(command, values)
            .await
    }

    /// Run a statement and return the number of affected rows.
    pub async fn execute(&self, command: &str, values: &[Value]) -> DbResult<u64> {
        self.current_source().execute(command, values).await
    }

    pub async fn execute_script(&self, command: &str) -> DbResult<()> {
        self.current_source().execute_script(command).await
    }

    pub async fn insert_returning(
        &self,
        command: &str,
        values: &[Value],
        generated: &GeneratedFields,
    ) -> DbResult<InsertResult> {
        self.current_source()
            .insert_returning(command, values, generated)
            .await
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Create the configured database.
    ///
    /// Runs on a server-level pool that does not select the database, and
    /// closes that pool afterwards. For SQLite the database file is created.
    pub async fn db_create(&self) -> DbResult<()> {
        let config = &self.inner.config;
        let dialect = config.db_type;
        let statement = match dialect {
            DatabaseType::PostgreSQL => {
                let mut sql = format!(
                    "CREATE DATABASE {}",
                    dialect.quote_identifier(&config.database)
                );
                if let Some(user) = &config.user {
                    sql.push_str(&format!(" OWNER {}", dialect.quote_identifier(user)));
                }
                Some(sql)
            }
            DatabaseType::MySQL => Some(format!(
                "CREATE DATABASE {}",
                dialect.quote_identifier(&config.database)
            )),
            DatabaseType::SQLite => None,
        };

        self.create_connection(false).await?;
        let result = match statement {
            Some(sql) => self.execute_admin(&sql).await,
            // opening a connection creates the file
            None => self.acquire_connection().await.map(drop),
        };
        self.close().await;
        result?;

        info!(
            connection = %self.name(),
            database = %config.database,
            "Database created"
        );
        Ok(())
    }

    /// Drop the configured database. A database that does not exist is not
    /// an error.
    pub async fn db_delete(&self) -> DbResult<()> {
        self.close().await;

        let config = &self.inner.config;
        let dialect = config.db_type;
        if dialect == DatabaseType::SQLite {
            return remove_sqlite_files(&config.database).await;
        }

        self.create_connection(false).await?;
        let sql = format!(
            "DROP DATABASE {}",
            dialect.quote_identifier(&config.database)
        );
        let result = match self.execute_admin(&sql).await {
            Err(e) if is_missing_database(&e) => {
                warn!(
                    connection = %self.name(),
                    database = %config.database,
                    "Database does not exist, nothing to drop"
                );
                Ok(())
            }
            other => other,
        };
        self.close().await;
        result?;

        info!(
            connection = %self.name(),
            database = %config.database,
            "Database dropped"
        );
        Ok(())
    }

    async fn execute_admin(&self, sql: &str) -> DbResult<()> {
        let mut conn = self.acquire_connection().await?;
        debug!(
            connection = %self.name(),
            sql = %sql,
            "Executing administrative statement"
        );
        self.inner.executor.execute_script(&mut conn, sql).await
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// New transaction scope, nested inside the current transaction if the
    /// calling task has one. Nothing runs until it is started.
    ///
    /// The current transaction is tracked per task. A task started with plain
    /// `tokio::spawn` sees no current transaction, so its statements run on
    /// pooled connections outside it; use
    /// [`spawn`](crate::db::transaction_registry::spawn) to carry it over.
    pub fn in_transaction(&self) -> TransactionScope {
        TransactionScope::new(self.clone(), self.current_transaction())
    }

    /// Create and start a transaction scope for manual commit or rollback.
    pub async fn start_transaction(&self) -> DbResult<TransactionScope> {
        let scope = self.in_transaction();
        scope.start().await?;
        Ok(scope)
    }

    /// Run `body` in a transaction: commit on success, roll back on error.
    ///
    /// Work that `body` hands to `tokio::spawn` is not part of the
    /// transaction; spawn it with
    /// [`spawn`](crate::db::transaction_registry::spawn) instead. Dropping the
    /// returned future while the body is still running closes the pinned
    /// connection, so nothing the body wrote is committed.
    pub async fn atomic<F, Fut, T, E>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce(TransactionScope) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError> + std::error::Error + 'static,
    {
        self.in_transaction().run(body).await
    }

    /// Scopes started and not yet finalized, across all tasks.
    pub fn active_transactions(&self) -> usize {
        self.inner.active_transactions.load(Ordering::SeqCst)
    }

    pub(crate) fn transaction_started(&self) {
        self.inner.active_transactions.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn transaction_finished(&self) {
        let _ = self.inner.active_transactions.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| n.checked_sub(1),
        );
    }
}

fn is_missing_database(err: &DbError) -> bool {
    let DbError::Driver(sqlx::Error::Database(db_err)) = err else {
        return false;
    };
    if db_err.code().as_deref() == Some(PG_UNDEFINED_DATABASE) {
        return true;
    }
    db_err
        .try_downcast_ref::<MySqlDatabaseError>()
        .is_some_and(|e| e.number() == MYSQL_DROP_MISSING_DATABASE)
}

async fn remove_sqlite_files(database: &str) -> DbResult<()> {
    if database == ":memory:" {
        return Ok(());
    }
    for suffix in ["", "-wal", "-shm"] {
        let path = format!("{database}{suffix}");
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path, "Removed SQLite file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(DbError::operational(
                    format!("Failed to remove {path}: {e}"),
                    None,
                ));
            }
        }
    }
    Ok(())
}

// =============================================================================
// Connection sources
// =============================================================================

/// The connection a data operation should use.
#[derive(Debug, Clone)]
pub enum ConnectionSource {
    /// No transaction: borrow a pooled connection per call.
    Client(Client),
    /// Use the transaction's pinned connection under its shared lock.
    Transaction(TransactionScope),
}

/// A connection held for one operation.
#[derive(Debug)]
pub enum ConnectionLease {
    Pooled(ScopedConnection),
    Pinned(PinnedGuard),
}

impl Deref for ConnectionLease {
    type Target = DbConnection;

    fn deref(&self) -> &Self::Target {
        match self {
            Self::Pooled(conn) => &**conn,
            Self::Pinned(guard) => &**guard,
        }
    }
}

impl DerefMut for ConnectionLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            Self::Pooled(conn) => &mut **conn,
            Self::Pinned(guard) => &mut **guard,
        }
    }
}

impl ConnectionSource {
    pub fn client(&self) -> &Client {
        match self {
            Self::Client(client) => client,
            Self::Transaction(scope) => scope.client(),
        }
    }

    pub fn transaction(&self) -> Option<&TransactionScope> {
        match self {
            Self::Client(_) => None,
            Self::Transaction(scope) => Some(scope),
        }
    }

    /// Hold a connection for one operation.
    ///
    /// Inside a transaction this waits for the scope's lock, so concurrent
    /// operations of one transaction run one after another.
    pub async fn acquire(&self) -> DbResult<ConnectionLease> {
        match self {
            Self::Client(client) => client
                .acquire_connection()
                .await
                .map(ConnectionLease::Pooled),
            Self::Transaction(scope) => scope.acquire_pinned().await.map(ConnectionLease::Pinned),
        }
    }

    /// Run an insert and return the row it produced, if any.
    pub async fn execute_insert(&self, command: &str, values: &[Value]) -> DbResult<Option<Row>> {
        let mut conn = self.acquire().await?;
        self.log_statement(command, values.len());
        self.executor()
            .fetch_optional(&mut conn, command, values)
            .await
    }

    /// Run `command` once per row of values, on one connection.
    pub async fn execute_many(&self, command: &str, rows: &[Vec<Value>]) -> DbResult<()> {
        let mut conn = self.acquire().await?;
        self.log_statement(command, rows.len());
        self.executor().execute_many(&mut conn, command, rows).await
    }

    pub async fn execute_query(&self, command: &str) -> DbResult<Vec<Row>> {
        self.execute_query_with(command, &[]).await
    }

    pub async fn execute_query_with(&self, command: &str, values: &[Value]) -> DbResult<Vec<Row>> {
        let mut conn = self.acquire().await?;
        self.log_statement(command, values.len());
        self.executor().fetch_all(&mut conn, command, values).await
    }

    pub async fn execute(&self, command: &str, values: &[Value]) -> DbResult<u64> {
        let mut conn = self.acquire().await?;
        self.log_statement(command, values.len());
        self.executor().execute(&mut conn, command, values).await
    }

    pub async fn execute_script(&self, command: &str) -> DbResult<()> {
        let mut conn = self.acquire().await?;
        self.log_statement(command, 0);
        self.executor().execute_script(&mut conn, command).await
    }

    /// Run an insert and collect the values the database generated for
    /// `generated`.
    ///
    /// Dialects with `RETURNING` get the clause appended. MySQL reads
    /// `LAST_INSERT_ID()` on the same connection, which fills the first
    /// generated field.
    pub async fn insert_returning(
        &self,
        command: &str,
        values: &[Value],
        generated: &GeneratedFields,
    ) -> DbResult<InsertResult> {
        let dialect = self.client().db_type();
        let mut conn = self.acquire().await?;

        if let Some(returning) = generated.returning_clause(dialect) {
            let sql = format!("{command}{returning}");
            self.log_statement(&sql, values.len());
            let row = self
                .executor()
                .fetch_optional(&mut conn, &sql, values)
                .await?;
            return Ok(generated.populate(row.as_ref()));
        }

        self.log_statement(command, values.len());
        self.executor().execute(&mut conn, command, values).await?;
        if generated.is_empty() {
            return Ok(InsertResult::default());
        }
        let row = self
            .executor()
            .fetch_optional(&mut conn, "SELECT LAST_INSERT_ID()", &[])
            .await?;
        Ok(generated.populate(row.as_ref()))
    }

    fn executor(&self) -> &StatementExecutor {
        self.client().executor()
    }

    fn log_statement(&self, sql: &str, values: usize) {
        debug!(
            connection = %self.client().name(),
            transaction_id = self.transaction().map(TransactionScope::id),
            sql = %sql,
            values,
            "Executing statement"
        );
    }
}
