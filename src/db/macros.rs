//! Database dispatch macros for reducing code duplication.
//!
//! Pools and pooled connections are held per backend (`BackendPool`,
//! `BackendConnection`). These macros expand the match over the backend arms
//! so call sites stay linear.

/// Dispatch over the `BackendPool` variants.
///
/// Either write one arm per backend, or give a single body that is expanded
/// for every backend (it is type-checked separately in each arm).
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(pool, {
///     MySql(p) => do_mysql(p),
///     Postgres(p) => do_postgres(p),
///     SQLite(p) => do_sqlite(p),
/// });
///
/// let size = impl_db_dispatch!(pool, p => p.size());
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($pool:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $pool {
            $(
                $crate::db::pool::BackendPool::$variant($p) => $body,
            )+
        }
    };
    ($pool:expr, $p:ident => $body:expr) => {
        match $pool {
            $crate::db::pool::BackendPool::MySql($p) => $body,
            $crate::db::pool::BackendPool::Postgres($p) => $body,
            $crate::db::pool::BackendPool::SQLite($p) => $body,
        }
    };
}

/// Dispatch over the `BackendConnection` variants, same forms as [`impl_db_dispatch!`].
#[macro_export]
macro_rules! impl_conn_dispatch {
    ($conn:expr, { $($variant:ident($c:ident) => $body:expr),+ $(,)? }) => {
        match $conn {
            $(
                $crate::db::pool::BackendConnection::$variant($c) => $body,
            )+
        }
    };
    ($conn:expr, $c:ident => $body:expr) => {
        match $conn {
            $crate::db::pool::BackendConnection::MySql($c) => $body,
            $crate::db::pool::BackendConnection::Postgres($c) => $body,
            $crate::db::pool::BackendConnection::SQLite($c) => $body,
        }
    };
}

pub use impl_conn_dispatch;
pub use impl_db_dispatch;

#[cfg(test)]
mod tests {
    use crate::db::pool::BackendPool;
    use crate::models::DatabaseType;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn test_dispatch_forms() {
        let pool = BackendPool::SQLite(
            SqlitePoolOptions::new()
                .min_connections(0)
                .connect_lazy("sqlite::memory:")
                .unwrap(),
        );

        let size = impl_db_dispatch!(&pool, p => p.size());
        assert_eq!(size, 0);

        let db_type = impl_db_dispatch!(&pool, {
            MySql(_p) => DatabaseType::MySQL,
            Postgres(_p) => DatabaseType::PostgreSQL,
            SQLite(_p) => DatabaseType::SQLite,
        });
        assert_eq!(db_type, DatabaseType::SQLite);
    }
}
