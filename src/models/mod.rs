//! Data models for scoped-db.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{
    Capabilities, ConnectionConfig, ConnectionConfigError, DatabaseType, TransactionInfo,
    TransactionState,
};
pub use query::{GeneratedField, GeneratedFields, InsertResult, Row, Value};
