//! Named clients.
//!
//! [`Connections`] maps connection names to [`Client`]s and resolves the
//! client a transaction helper should use when the caller names none.

use crate::db::client::Client;
use crate::db::transaction::TransactionScope;
use crate::error::{DbError, DbResult};
use crate::models::ConnectionConfig;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};

/// Registry of configured clients. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Connections {
    clients: Arc<RwLock<HashMap<String, Client>>>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client for `config` without connecting.
    ///
    /// Fails if the name is already taken.
    pub fn register(&self, config: ConnectionConfig) -> DbResult<Client> {
        let mut clients = self.write();
        if clients.contains_key(&config.name) {
            return Err(DbError::params(format!(
                "Connection '{}' is already registered",
                config.name
            )));
        }
        let client = Client::new(config)?;
        clients.insert(client.name().to_string(), client.clone());
        Ok(client)
    }

    /// Register a client and open its pool.
    pub async fn connect(&self, config: ConnectionConfig) -> DbResult<Client> {
        let client = self.register(config)?;
        if let Err(e) = client.create_connection(true).await {
            self.write().remove(client.name());
            return Err(e);
        }
        Ok(client)
    }

    /// Register and connect every config, creating the databases first when
    /// `create_db` is set.
    pub async fn init(&self, configs: Vec<ConnectionConfig>, create_db: bool) -> DbResult<()> {
        for config in configs {
            let client = self.register(config)?;
            if create_db {
                client.db_create().await?;
            }
            client.create_connection(true).await?;
        }
        info!(connections = self.count(), "Connections initialized");
        Ok(())
    }

    pub fn get(&self, name: &str) -> DbResult<Client> {
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::connection_not_found(name))
    }

    /// Client for `name`, or the only registered client when `name` is
    /// `None`.
    pub fn resolve(&self, name: Option<&str>) -> DbResult<Client> {
        if let Some(name) = name {
            return self.get(name);
        }
        let clients = self.read();
        let mut iter = clients.values();
        match (iter.next(), iter.next()) {
            (Some(client), None) => Ok(client.clone()),
            (None, _) => Err(DbError::params("No connections are registered")),
            _ => {
                let mut names: Vec<&str> = clients.keys().map(String::as_str).collect();
                names.sort_unstable();
                Err(DbError::params(format!(
                    "You are running with multiple databases, so you should specify connection_name: {:?}",
                    names
                )))
            }
        }
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Close every pool. Returns `false` if any close ran out of grace time.
    pub async fn close_all(&self) -> bool {
        let clients = self.clients();
        join_all(clients.iter().map(Client::close))
            .await
            .into_iter()
            .all(|graceful| graceful)
    }

    /// Close every client and drop its database, then forget all clients.
    pub async fn drop_databases(&self) -> DbResult<()> {
        let mut first_error = None;
        for client in self.clients() {
            if let Err(e) = client.db_delete().await {
                warn!(connection = %client.name(), error = %e, "Failed to drop database");
                first_error.get_or_insert(e);
            }
        }
        self.write().clear();
        first_error.map_or(Ok(()), Err)
    }

    /// New, unstarted transaction scope on the resolved client.
    pub fn in_transaction(&self, name: Option<&str>) -> DbResult<TransactionScope> {
        Ok(self.resolve(name)?.in_transaction())
    }

    /// Started transaction scope on the resolved client.
    pub async fn start_transaction(&self, name: Option<&str>) -> DbResult<TransactionScope> {
        self.resolve(name)?.start_transaction().await
    }

    /// Run `body` in a transaction on the resolved client.
    pub async fn atomic<F, Fut, T, E>(&self, name: Option<&str>, body: F) -> Result<T, E>
    where
        F: FnOnce(TransactionScope) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError> + std::error::Error + 'static,
    {
        let client = self.resolve(name)?;
        client.atomic(body).await
    }

    fn clients(&self) -> Vec<Client> {
        self.read().values().cloned().collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Client>> {
        self.clients.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Client>> {
        self.clients.write().unwrap_or_else(PoisonError::into_inner)
    }
}
