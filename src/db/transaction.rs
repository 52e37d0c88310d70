//! Transaction scopes.
//!
//! A [`TransactionScope`] pins one pooled connection for its whole lifetime
//! and walks `created -> started -> committed | rolled back -> finalized`.
//! Nested scopes reuse the root's pinned connection and its lock and open a
//! savepoint on it, so every statement of one nesting chain is serialized on
//! one physical connection.
//!
//! While a scope is current in the registry, data operations issued through
//! its client run on the pinned connection automatically.

use crate::db::client::{Client, ConnectionSource};
use crate::db::executor::terminated_error;
use crate::db::pool::DbConnection;
use crate::db::transaction_registry::{TransactionRegistry, task_scope};
use crate::error::{DbError, DbResult};
use crate::models::{TransactionInfo, TransactionState};
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMappedMutexGuard, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Exclusive access to a pinned connection, held for one operation.
pub type PinnedGuard = OwnedMappedMutexGuard<PinnedSlot, DbConnection>;

/// Storage for a pinned connection.
///
/// A connection still stored here when the slot is dropped was never
/// released by its root scope, so it is closed instead of returned.
#[derive(Debug)]
pub struct PinnedSlot {
    conn: Option<DbConnection>,
    /// The pool was terminated and the connection discarded.
    terminated: bool,
}

impl Drop for PinnedSlot {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.close_on_drop();
        }
    }
}

/// Connection pinned by a root scope and shared by its nested scopes.
#[derive(Debug, Clone)]
pub struct PinnedConnection {
    slot: Arc<AsyncMutex<PinnedSlot>>,
}

impl PinnedConnection {
    fn new(conn: DbConnection) -> Self {
        Self {
            slot: Arc::new(AsyncMutex::new(PinnedSlot {
                conn: Some(conn),
                terminated: false,
            })),
        }
    }

    /// Wait for the shared lock and borrow the connection.
    ///
    /// A connection whose pool was terminated is closed here and every
    /// later lock fails with [`DbError::Connection`].
    pub(crate) async fn lock(&self, transaction_id: &str) -> DbResult<PinnedGuard> {
        let mut guard = Arc::clone(&self.slot).lock_owned().await;
        if guard.conn.as_ref().is_some_and(DbConnection::is_terminated) {
            if let Some(mut conn) = guard.conn.take() {
                conn.close_on_drop();
            }
            guard.terminated = true;
            warn!(
                transaction_id = %transaction_id,
                "Pinned connection terminated by pool close, discarding it"
            );
        }
        if guard.terminated {
            return Err(terminated_error("transaction"));
        }
        OwnedMutexGuard::try_map(guard, |slot| slot.conn.as_mut()).map_err(|_| {
            DbError::transaction_management(
                "Pinned connection has already been released",
                transaction_id,
            )
        })
    }

    /// Same physical connection and same lock.
    pub fn same_as(&self, other: &PinnedConnection) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    async fn release(&self, close: bool) {
        let conn = self.slot.lock().await.conn.take();
        match conn {
            Some(mut conn) if conn.is_terminated() => conn.close_on_drop(),
            Some(conn) if close => conn.close().await,
            Some(conn) => drop(conn),
            None => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Commit,
    Rollback,
}

impl Termination {
    fn verb(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Rollback => "roll back",
        }
    }

    fn outcome(self) -> TransactionState {
        match self {
            Self::Commit => TransactionState::Committed,
            Self::Rollback => TransactionState::RolledBack,
        }
    }
}

struct ScopeState {
    phase: TransactionState,
    pinned: Option<PinnedConnection>,
    /// Registry entry replaced by `start`, put back by `finalize`.
    previous: Option<TransactionScope>,
    /// BEGIN or SAVEPOINT issued and not yet terminated.
    native_open: bool,
    /// start, commit or rollback is awaiting the database.
    in_flight: bool,
    started_at: Option<DateTime<Utc>>,
}

/// Clears `in_flight` when start, commit or rollback finishes, including
/// when the calling future is dropped mid-await.
struct InFlight<'a> {
    scope: &'a TransactionScope,
    armed: bool,
}

impl<'a> InFlight<'a> {
    fn enter(scope: &'a TransactionScope, state: &mut ScopeState) -> Self {
        state.in_flight = true;
        Self { scope, armed: true }
    }

    /// Clear the flag and apply `update` under the same lock.
    fn finish(mut self, update: impl FnOnce(&mut ScopeState)) {
        self.armed = false;
        let mut state = self.scope.lock_state();
        state.in_flight = false;
        update(&mut state);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.scope.lock_state().in_flight = false;
        }
    }
}

struct ScopeInner {
    id: String,
    client: Client,
    parent: Option<TransactionScope>,
    depth: usize,
    state: Mutex<ScopeState>,
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if matches!(
            state.phase,
            TransactionState::Created | TransactionState::Finalized
        ) {
            return;
        }
        warn!(
            connection = %self.client.name(),
            transaction_id = %self.id,
            depth = self.depth,
            "Transaction dropped without finalize"
        );
        self.client.transaction_finished();
    }
}

/// One, possibly nested, database transaction.
///
/// Cloning yields another handle to the same scope.
#[derive(Clone)]
pub struct TransactionScope {
    inner: Arc<ScopeInner>,
}

impl fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionScope")
            .field("id", &self.inner.id)
            .field("connection", &self.inner.client.name())
            .field("depth", &self.inner.depth)
            .field("state", &self.state())
            .finish()
    }
}

impl TransactionScope {
    pub(crate) fn new(client: Client, parent: Option<TransactionScope>) -> Self {
        let depth = parent.as_ref().map_or(0, |p| p.inner.depth + 1);
        Self {
            inner: Arc::new(ScopeInner {
                id: generate_transaction_id(),
                client,
                parent,
                depth,
                state: Mutex::new(ScopeState {
                    phase: TransactionState::Created,
                    pinned: None,
                    previous: None,
                    native_open: false,
                    in_flight: false,
                    started_at: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn connection_name(&self) -> &str {
        self.inner.client.name()
    }

    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    /// 0 for a root scope.
    pub fn depth(&self) -> usize {
        self.inner.depth
    }

    pub fn is_root(&self) -> bool {
        self.inner.parent.is_none()
    }

    pub fn parent(&self) -> Option<&TransactionScope> {
        self.inner.parent.as_ref()
    }

    pub fn state(&self) -> TransactionState {
        self.lock_state().phase
    }

    pub fn is_finalized(&self) -> bool {
        self.state() == TransactionState::Finalized
    }

    /// Handle identity, not transaction equality.
    pub fn ptr_eq(&self, other: &TransactionScope) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Connection pinned by this scope while it is started.
    pub fn pinned_connection(&self) -> Option<PinnedConnection> {
        self.lock_state().pinned.clone()
    }

    /// True when both scopes run on the same pinned connection and lock.
    pub fn shares_connection_with(&self, other: &TransactionScope) -> bool {
        match (self.pinned_connection(), other.pinned_connection()) {
            (Some(a), Some(b)) => a.same_as(&b),
            _ => false,
        }
    }

    /// Route statements explicitly through this scope.
    pub fn source(&self) -> ConnectionSource {
        ConnectionSource::Transaction(self.clone())
    }

    pub fn info(&self) -> TransactionInfo {
        let state = self.lock_state();
        TransactionInfo {
            id: self.inner.id.clone(),
            connection_name: self.inner.client.name().to_string(),
            depth: self.inner.depth,
            started_at: state.started_at,
            state: state.phase,
        }
    }

    /// Pin a connection, begin the native transaction (or savepoint) and
    /// become the current transaction of the calling task.
    ///
    /// Must run inside a registry context, see
    /// [`task_scope`](crate::db::transaction_registry::task_scope).
    pub async fn start(&self) -> DbResult<()> {
        let in_flight = {
            let mut state = self.lock_state();
            if state.phase != TransactionState::Created || state.in_flight {
                return Err(DbError::operational(
                    format!("Transaction {} has already been started", self.inner.id),
                    None,
                ));
            }
            TransactionRegistry::ensure_task_context()?;
            InFlight::enter(self, &mut state)
        };

        // a cancelled open drops the new slot, which closes its connection
        let pinned = self.open().await?;
        let previous = self
            .inner
            .client
            .registry()
            .set_current(Some(self.clone()))?;
        in_flight.finish(|state| {
            state.phase = TransactionState::Started;
            state.pinned = Some(pinned);
            state.previous = previous;
            state.native_open = true;
            state.started_at = Some(Utc::now());
        });

        self.inner.client.transaction_started();
        info!(
            connection = %self.inner.client.name(),
            transaction_id = %self.inner.id,
            depth = self.inner.depth,
            "Transaction started"
        );
        Ok(())
    }

    async fn open(&self) -> DbResult<PinnedConnection> {
        match &self.inner.parent {
            None => {
                let conn = self.inner.client.pool().await?.acquire().await?;
                let pinned = PinnedConnection::new(conn);
                let begin = self.inner.client.db_type().begin_statement();
                // on failure the slot is dropped and the connection closed
                self.run_commands(&pinned, &[begin]).await?;
                Ok(pinned)
            }
            Some(parent) => {
                let pinned = parent.pinned_for_statements()?;
                let savepoint = format!("SAVEPOINT {}", self.inner.id);
                self.run_commands(&pinned, &[savepoint.as_str()]).await?;
                Ok(pinned)
            }
        }
    }

    /// Commit, then finalize.
    pub async fn commit(&self) -> DbResult<()> {
        self.terminate(Termination::Commit).await
    }

    /// Roll back, then finalize.
    pub async fn rollback(&self) -> DbResult<()> {
        self.terminate(Termination::Rollback).await
    }

    /// Commit or roll back, then finalize.
    ///
    /// If the caller is cancelled while the command is awaiting the database,
    /// the scope stays started with its native transaction open; a later
    /// [`finalize`](Self::finalize) then closes the connection instead of
    /// returning it to the pool.
    async fn terminate(&self, how: Termination) -> DbResult<()> {
        let (pinned, in_flight) = {
            let mut state = self.lock_state();
            if state.phase == TransactionState::Created {
                return Err(DbError::operational(
                    format!("Cannot {}: transaction has not been started", how.verb()),
                    None,
                ));
            }
            if state.in_flight {
                return Err(self.management_error(format!(
                    "Cannot {}: a commit or rollback is already in progress",
                    how.verb()
                )));
            }
            if state.phase.is_ended() {
                return Err(self.management_error(format!(
                    "Cannot {}: transaction already finalized",
                    how.verb()
                )));
            }
            let pinned = state.pinned.clone();
            (pinned, InFlight::enter(self, &mut state))
        };

        let result = match pinned {
            Some(pinned) => self.send_termination(&pinned, how).await,
            None => Err(self.management_error("Pinned connection has already been released")),
        };
        in_flight.finish(|state| {
            if result.is_ok() {
                state.native_open = false;
                state.phase = how.outcome();
            }
        });

        match &result {
            Ok(()) => info!(
                connection = %self.inner.client.name(),
                transaction_id = %self.inner.id,
                depth = self.inner.depth,
                "Transaction {}",
                match how {
                    Termination::Commit => "committed",
                    Termination::Rollback => "rolled back",
                }
            ),
            Err(e) => warn!(
                connection = %self.inner.client.name(),
                transaction_id = %self.inner.id,
                error = %e,
                "Failed to {} transaction",
                how.verb()
            ),
        }

        let finalized = self.finalize().await;
        result.and(finalized)
    }

    async fn send_termination(&self, pinned: &PinnedConnection, how: Termination) -> DbResult<()> {
        if self.is_root() {
            let command = match how {
                Termination::Commit => "COMMIT",
                Termination::Rollback => "ROLLBACK",
            };
            return self.run_commands(pinned, &[command]).await;
        }

        let release = format!("RELEASE SAVEPOINT {}", self.inner.id);
        match how {
            Termination::Commit => self.run_commands(pinned, &[release.as_str()]).await,
            Termination::Rollback => {
                let rollback = format!("ROLLBACK TO SAVEPOINT {}", self.inner.id);
                self.run_commands(pinned, &[rollback.as_str(), release.as_str()])
                    .await
            }
        }
    }

    /// Release the pinned connection and restore the registry.
    ///
    /// Runs exactly once per started scope. Only the root scope gives the
    /// connection back; if its native transaction is still open the
    /// connection is closed instead.
    pub async fn finalize(&self) -> DbResult<()> {
        let (pinned, previous, native_open) = {
            let mut state = self.lock_state();
            match state.phase {
                TransactionState::Created => {
                    return Err(DbError::operational(
                        "Finalize was called before transaction start",
                        None,
                    ));
                }
                TransactionState::Finalized => {
                    return Err(self.management_error("Transaction already finalized"));
                }
                _ if state.in_flight => {
                    return Err(
                        self.management_error("Cannot finalize while a commit or rollback is in progress")
                    );
                }
                _ => {}
            }
            state.phase = TransactionState::Finalized;
            (state.pinned.take(), state.previous.take(), state.native_open)
        };

        self.inner.client.registry().restore(self, previous);
        self.inner.client.transaction_finished();

        let close = native_open && self.is_root();
        if let (true, Some(pinned)) = (self.is_root(), pinned) {
            pinned.release(close).await;
        }

        debug!(
            connection = %self.inner.client.name(),
            transaction_id = %self.inner.id,
            closed_connection = close,
            "Transaction finalized"
        );
        Ok(())
    }

    /// Run `body` inside this scope.
    ///
    /// Starts the scope in a fresh registry context, commits when the body
    /// succeeds and rolls back when it fails. A failure caused by a
    /// [`DbError::TransactionManagement`] only finalizes the scope. The body's
    /// error is returned unchanged.
    pub async fn run<F, Fut, T, E>(self, body: F) -> Result<T, E>
    where
        F: FnOnce(TransactionScope) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError> + std::error::Error + 'static,
    {
        task_scope(async move {
            self.start().await?;
            match body(self.clone()).await {
                Ok(value) => {
                    self.commit().await?;
                    Ok(value)
                }
                Err(err) => {
                    let management = caused_by_transaction_management(&err);
                    self.exit_with_error(management).await;
                    Err(err)
                }
            }
        })
        .await
    }

    async fn exit_with_error(&self, management: bool) {
        if self.is_finalized() {
            return;
        }
        let cleanup = if management {
            self.finalize().await
        } else {
            self.rollback().await
        };
        if let Err(e) = cleanup {
            warn!(
                transaction_id = %self.inner.id,
                error = %e,
                "Transaction cleanup after error failed"
            );
        }
    }

    /// Pinned connection for data operations; the scope must be started and
    /// not terminating.
    fn pinned_for_statements(&self) -> DbResult<PinnedConnection> {
        let state = self.lock_state();
        match state.phase {
            TransactionState::Created => Err(DbError::operational(
                format!("Transaction {} has not been started", self.inner.id),
                None,
            )),
            TransactionState::Started if !state.in_flight => state
                .pinned
                .clone()
                .ok_or_else(|| self.management_error("Pinned connection has already been released")),
            _ => Err(self.management_error("Transaction is no longer active")),
        }
    }

    /// Borrow the pinned connection for one data operation.
    pub(crate) async fn acquire_pinned(&self) -> DbResult<PinnedGuard> {
        let pinned = self.pinned_for_statements()?;
        let guard = pinned.lock(&self.inner.id).await?;
        // the scope may have been terminated while waiting for the lock
        self.pinned_for_statements()?;
        Ok(guard)
    }

    async fn run_commands(&self, pinned: &PinnedConnection, commands: &[&str]) -> DbResult<()> {
        let mut conn = pinned.lock(&self.inner.id).await?;
        for sql in commands {
            debug!(
                connection = %self.inner.client.name(),
                transaction_id = %self.inner.id,
                sql = %sql,
                "Executing transaction command"
            );
            self.inner
                .client
                .executor()
                .execute_script(&mut conn, sql)
                .await?;
        }
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, ScopeState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn management_error(&self, message: impl Into<String>) -> DbError {
        DbError::transaction_management(message, self.inner.id.clone())
    }
}

/// True when `err` or any error in its source chain is a
/// [`DbError::TransactionManagement`].
fn caused_by_transaction_management(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.downcast_ref::<DbError>()
            .is_some_and(DbError::is_transaction_management)
        {
            return true;
        }
        current = e.source();
    }
    false
}

fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}
