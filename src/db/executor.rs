//! Statement execution engine.
//!
//! Runs statements on one borrowed connection (pooled or pinned by a
//! transaction) with an optional per-statement timeout. A statement is also
//! aborted when its pool is terminated after a timed-out close. Driver errors
//! leave through [`crate::error::translate`].
//!
//! # Architecture
//!
//! The executor uses database-specific implementations organized in submodules:
//! - `mysql`: MySQL-specific statement execution
//! - `postgres`: PostgreSQL-specific statement execution
//! - `sqlite`: SQLite-specific statement execution
//!
//! Statements without bound values are sent as raw SQL, so scripts with
//! several statements and commands that cannot be prepared still work.

use crate::db::pool::{DbConnection, ShutdownSignal};
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{Row, Value};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::debug;

/// Statement executor shared by a client and all its transaction scopes.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatementExecutor {
    statement_timeout: Option<Duration>,
}

impl StatementExecutor {
    pub fn new(statement_timeout: Option<Duration>) -> Self {
        Self { statement_timeout }
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout
    }

    /// Run a statement and return its first row, if any.
    pub async fn fetch_optional(
        &self,
        conn: &mut DbConnection,
        sql: &str,
        values: &[Value],
    ) -> DbResult<Option<Row>> {
        let outcome = {
            let (backend, shutdown) = conn.parts();
            self.bounded(shutdown, async {
                impl_conn_dispatch!(backend, {
                    MySql(c) => mysql::fetch_optional(c, sql, values).await,
                    Postgres(c) => postgres::fetch_optional(c, sql, values).await,
                    SQLite(c) => sqlite::fetch_optional(c, sql, values).await,
                })
            })
            .await
        };
        finish(conn, "statement execution", outcome)
    }

    /// Run a query and return every row.
    pub async fn fetch_all(
        &self,
        conn: &mut DbConnection,
        sql: &str,
        values: &[Value],
    ) -> DbResult<Vec<Row>> {
        let start = Instant::now();
        let outcome = {
            let (backend, shutdown) = conn.parts();
            self.bounded(shutdown, async {
                impl_conn_dispatch!(backend, {
                    MySql(c) => mysql::fetch_all(c, sql, values).await,
                    Postgres(c) => postgres::fetch_all(c, sql, values).await,
                    SQLite(c) => sqlite::fetch_all(c, sql, values).await,
                })
            })
            .await
        };
        let rows = finish(conn, "query execution", outcome)?;
        debug!(
            row_count = rows.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Query returned"
        );
        Ok(rows)
    }

    /// Run a statement and return the number of affected rows.
    pub async fn execute(
        &self,
        conn: &mut DbConnection,
        sql: &str,
        values: &[Value],
    ) -> DbResult<u64> {
        let outcome = {
            let (backend, shutdown) = conn.parts();
            self.bounded(shutdown, async {
                impl_conn_dispatch!(backend, {
                    MySql(c) => mysql::execute(c, sql, values).await,
                    Postgres(c) => postgres::execute(c, sql, values).await,
                    SQLite(c) => sqlite::execute(c, sql, values).await,
                })
            })
            .await
        };
        finish(conn, "statement execution", outcome)
    }

    /// Run one statement per row of values. The timeout applies to each row.
    pub async fn execute_many(
        &self,
        conn: &mut DbConnection,
        sql: &str,
        rows: &[Vec<Value>],
    ) -> DbResult<()> {
        for values in rows {
            self.execute(conn, sql, values).await?;
        }
        Ok(())
    }

    /// Run raw SQL that may contain several statements.
    pub async fn execute_script(&self, conn: &mut DbConnection, sql: &str) -> DbResult<()> {
        self.execute(conn, sql, &[]).await.map(|_| ())
    }

    async fn bounded<T, Fut>(&self, shutdown: &ShutdownSignal, fut: Fut) -> Outcome<T>
    where
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let statement = async {
            match self.statement_timeout {
                Some(limit) => match timeout(limit, fut).await {
                    Ok(result) => Outcome::Done(result),
                    Err(_) => Outcome::TimedOut(limit),
                },
                None => Outcome::Done(fut.await),
            }
        };
        tokio::select! {
            biased;
            _ = shutdown.fired() => Outcome::Terminated,
            outcome = statement => outcome,
        }
    }
}

enum Outcome<T> {
    Done(Result<T, sqlx::Error>),
    TimedOut(Duration),
    Terminated,
}

/// A connection whose statement timed out or was aborted is in an unknown
/// protocol state, so it is closed on release instead of going back to the
/// pool.
fn finish<T>(conn: &mut DbConnection, operation: &str, outcome: Outcome<T>) -> DbResult<T> {
    match outcome {
        Outcome::Done(result) => result.map_err(DbError::from),
        Outcome::TimedOut(limit) => {
            conn.close_on_drop();
            Err(DbError::timeout(operation, limit.as_secs()))
        }
        Outcome::Terminated => {
            conn.close_on_drop();
            Err(terminated_error(operation))
        }
    }
}

pub(crate) fn terminated_error(operation: &str) -> DbError {
    DbError::connection(
        format!("Connection terminated during {operation}: the pool was closed and its grace period ran out"),
        "Retry the operation; the client opens a new pool on next use",
    )
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module below provides the same interface adapted to its database type.

mod mysql {
    use super::*;
    use crate::db::params::bind_values;
    use sqlx::pool::PoolConnection;
    use sqlx::{Executor, MySql};

    pub async fn fetch_optional(
        conn: &mut PoolConnection<MySql>,
        sql: &str,
        values: &[Value],
    ) -> Result<Option<Row>, sqlx::Error> {
        let row = if values.is_empty() {
            conn.fetch_optional(sql).await?
        } else {
            bind_values(sqlx::query::<MySql>(sql), values)
                .fetch_optional(&mut **conn)
                .await?
        };
        Ok(row.map(|r| r.to_row()))
    }

    pub async fn fetch_all(
        conn: &mut PoolConnection<MySql>,
        sql: &str,
        values: &[Value],
    ) -> Result<Vec<Row>, sqlx::Error> {
        let rows = if values.is_empty() {
            conn.fetch_all(sql).await?
        } else {
            bind_values(sqlx::query::<MySql>(sql), values)
                .fetch_all(&mut **conn)
                .await?
        };
        Ok(rows.iter().map(RowToJson::to_row).collect())
    }

    pub async fn execute(
        conn: &mut PoolConnection<MySql>,
        sql: &str,
        values: &[Value],
    ) -> Result<u64, sqlx::Error> {
        let result = if values.is_empty() {
            conn.execute(sql).await?
        } else {
            bind_values(sqlx::query::<MySql>(sql), values)
                .execute(&mut **conn)
                .await?
        };
        Ok(result.rows_affected())
    }
}

mod postgres {
    use super::*;
    use crate::db::params::bind_values;
    use sqlx::pool::PoolConnection;
    use sqlx::{Executor, Postgres};

    pub async fn fetch_optional(
        conn: &mut PoolConnection<Postgres>,
        sql: &str,
        values: &[Value],
    ) -> Result<Option<Row>, sqlx::Error> {
        let row = if values.is_empty() {
            conn.fetch_optional(sql).await?
        } else {
            bind_values(sqlx::query::<Postgres>(sql), values)
                .fetch_optional(&mut **conn)
                .await?
        };
        Ok(row.map(|r| r.to_row()))
    }

    pub async fn fetch_all(
        conn: &mut PoolConnection<Postgres>,
        sql: &str,
        values: &[Value],
    ) -> Result<Vec<Row>, sqlx::Error> {
        let rows = if values.is_empty() {
            conn.fetch_all(sql).await?
        } else {
            bind_values(sqlx::query::<Postgres>(sql), values)
                .fetch_all(&mut **conn)
                .await?
        };
        Ok(rows.iter().map(RowToJson::to_row).collect())
    }

    pub async fn execute(
        conn: &mut PoolConnection<Postgres>,
        sql: &str,
        values: &[Value],
    ) -> Result<u64, sqlx::Error> {
        let result = if values.is_empty() {
            conn.execute(sql).await?
        } else {
            bind_values(sqlx::query::<Postgres>(sql), values)
                .execute(&mut **conn)
                .await?
        };
        Ok(result.rows_affected())
    }
}

mod sqlite {
    use super::*;
    use crate::db::params::bind_values;
    use sqlx::pool::PoolConnection;
    use sqlx::{Executor, Sqlite};

    pub async fn fetch_optional(
        conn: &mut PoolConnection<Sqlite>,
        sql: &str,
        values: &[Value],
    ) -> Result<Option<Row>, sqlx::Error> {
        let row = if values.is_empty() {
            conn.fetch_optional(sql).await?
        } else {
            bind_values(sqlx::query::<Sqlite>(sql), values)
                .fetch_optional(&mut **conn)
                .await?
        };
        Ok(row.map(|r| r.to_row()))
    }

    pub async fn fetch_all(
        conn: &mut PoolConnection<Sqlite>,
        sql: &str,
        values: &[Value],
    ) -> Result<Vec<Row>, sqlx::Error> {
        let rows = if values.is_empty() {
            conn.fetch_all(sql).await?
        } else {
            bind_values(sqlx::query::<Sqlite>(sql), values)
                .fetch_all(&mut **conn)
                .await?
        };
        Ok(rows.iter().map(RowToJson::to_row).collect())
    }

    pub async fn execute(
        conn: &mut PoolConnection<Sqlite>,
        sql: &str,
        values: &[Value],
    ) -> Result<u64, sqlx::Error> {
        let result = if values.is_empty() {
            conn.execute(sql).await?
        } else {
            bind_values(sqlx::query::<Sqlite>(sql), values)
                .execute(&mut **conn)
                .await?
        };
        Ok(result.rows_affected())
    }
}
