//! Shared helpers for integration tests.

#![allow(dead_code)]

use scoped_db::config::PoolOptions;
use scoped_db::db::Client;
use scoped_db::models::{ConnectionConfig, DatabaseType};
use tempfile::TempDir;

pub const SCHEMA: &str = "
    CREATE TABLE authors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    );
    CREATE TABLE books (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        author_id INTEGER NOT NULL REFERENCES authors(id),
        title TEXT NOT NULL
    );
";

/// A client on a fresh SQLite file. The file lives as long as this value.
pub struct TestDb {
    pub client: Client,
    pub path: String,
    _dir: TempDir,
}

/// Client without any tables.
pub fn sqlite_client(name: &str, options: PoolOptions) -> TestDb {
    let dir = tempfile::tempdir().unwrap();
    let path = dir
        .path()
        .join(format!("{name}.db"))
        .to_str()
        .unwrap()
        .to_string();
    let config = ConnectionConfig::new(name, DatabaseType::SQLite, path.clone())
        .unwrap()
        .with_pool_options(options);
    TestDb {
        client: Client::new(config).unwrap(),
        path,
        _dir: dir,
    }
}

/// Client with the authors/books schema created.
pub async fn setup_db(name: &str, options: PoolOptions) -> TestDb {
    let db = sqlite_client(name, options);
    db.client.execute_script(SCHEMA).await.unwrap();
    db
}

/// Pool options sized for concurrent tests.
pub fn pooled(max: u32) -> PoolOptions {
    PoolOptions {
        max_connections: Some(max),
        min_connections: Some(1),
        acquire_timeout_secs: Some(30),
        ..Default::default()
    }
}

pub async fn count(client: &Client, table: &str) -> i64 {
    let rows = client
        .execute_query(&format!("SELECT COUNT(*) AS n FROM {table}"))
        .await
        .unwrap();
    rows[0].get_i64("n").unwrap()
}
