//! Database layer.
//!
//! This module provides connection and transaction management:
//! - Connection pools and scoped connection acquisition
//! - Statement execution and row decoding
//! - The task-local current-transaction registry
//! - Transaction scopes with savepoint nesting
//! - Clients and the named connection registry
//! - Database dispatch macros for reducing code duplication

#[macro_use]
pub mod macros;
pub mod client;
pub mod connections;
pub mod executor;
pub mod params;
pub mod pool;
pub mod transaction;
pub mod transaction_registry;
pub mod types;

pub use client::{Client, ConnectionLease, ConnectionSource};
pub use connections::Connections;
pub use executor::StatementExecutor;
pub use pool::{DatabaseTarget, DbConnection, DbPool, PoolStatus, ScopedConnection};
pub use transaction::{PinnedConnection, PinnedGuard, TransactionScope};
pub use transaction_registry::{TransactionRegistry, spawn, task_scope};
