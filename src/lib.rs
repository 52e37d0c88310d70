//! Scoped DB
//!
//! Connection and transaction management for SQL databases (PostgreSQL,
//! MySQL, SQLite): pooled connections, a task-local current-transaction
//! registry, and nested transaction scopes that pin one connection for their
//! whole lifetime.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{Config, DatabaseConfig, PoolOptions};
pub use db::{
    Client, ConnectionSource, Connections, TransactionScope, spawn, task_scope,
};
pub use error::{DbError, DbResult};
pub use models::{Capabilities, ConnectionConfig, DatabaseType, Row, Value};
