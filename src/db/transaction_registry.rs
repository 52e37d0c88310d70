//! Current-transaction registry.
//!
//! Records which [`TransactionScope`] is active for a client in the calling
//! task. Entries live in a tokio task-local map keyed by client, so two tasks
//! sharing one client never observe each other's transaction. Data operations
//! consult the registry to choose between a pooled connection and the pinned
//! connection of the active transaction.
//!
//! A registry context is established by [`task_scope`] or [`spawn`]. Both
//! copy the caller's entries on entry, so a child task starts inside the
//! caller's transaction but changes it makes are invisible to the caller.

use crate::db::transaction::TransactionScope;
use crate::error::{DbError, DbResult};
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tracing::warn;

tokio::task_local! {
    static CONTEXT: RefCell<HashMap<u64, TransactionScope>>;
}

static NEXT_REGISTRY_KEY: AtomicU64 = AtomicU64::new(1);

/// Per-client view of the task-local transaction map.
#[derive(Debug, Clone)]
pub struct TransactionRegistry {
    key: u64,
    connection_name: Arc<str>,
}

impl TransactionRegistry {
    pub fn new(connection_name: &str) -> Self {
        Self {
            key: NEXT_REGISTRY_KEY.fetch_add(1, Ordering::Relaxed),
            connection_name: Arc::from(connection_name),
        }
    }

    /// Transaction active for this client in the calling task, if any.
    pub fn current(&self) -> Option<TransactionScope> {
        CONTEXT
            .try_with(|ctx| ctx.borrow().get(&self.key).cloned())
            .ok()
            .flatten()
    }

    /// True when the calling task runs inside a registry context.
    pub fn in_task_context() -> bool {
        CONTEXT.try_with(|_| ()).is_ok()
    }

    pub(crate) fn ensure_task_context() -> DbResult<()> {
        if Self::in_task_context() {
            Ok(())
        } else {
            Err(no_context_error())
        }
    }

    /// Make `scope` current and return the previous entry.
    pub(crate) fn set_current(
        &self,
        scope: Option<TransactionScope>,
    ) -> DbResult<Option<TransactionScope>> {
        CONTEXT
            .try_with(|ctx| {
                let mut map = ctx.borrow_mut();
                match scope {
                    Some(scope) => map.insert(self.key, scope),
                    None => map.remove(&self.key),
                }
            })
            .map_err(|_| no_context_error())
    }

    /// Put `previous` back, provided `finishing` is still the current entry.
    ///
    /// Scopes finished out of order leave the registry untouched.
    pub(crate) fn restore(&self, finishing: &TransactionScope, previous: Option<TransactionScope>) {
        let restored = CONTEXT.try_with(|ctx| {
            let mut map = ctx.borrow_mut();
            let is_current = map
                .get(&self.key)
                .is_some_and(|current| current.ptr_eq(finishing));
            if !is_current {
                return false;
            }
            match previous {
                Some(previous) => map.insert(self.key, previous),
                None => map.remove(&self.key),
            };
            true
        });

        if !matches!(restored, Ok(true)) {
            warn!(
                connection = %self.connection_name,
                transaction_id = %finishing.id(),
                "Finished transaction is not current in this task, registry left unchanged"
            );
        }
    }
}

fn no_context_error() -> DbError {
    DbError::operational(
        "No transaction context in this task; run the work through task_scope, spawn or TransactionScope::run",
        None,
    )
}

fn snapshot() -> HashMap<u64, TransactionScope> {
    CONTEXT
        .try_with(|ctx| ctx.borrow().clone())
        .unwrap_or_default()
}

/// Run `fut` in a fresh registry context that inherits the caller's entries.
pub async fn task_scope<F: Future>(fut: F) -> F::Output {
    CONTEXT.scope(RefCell::new(snapshot()), fut).await
}

/// Spawn a tokio task inheriting the caller's registry entries.
///
/// Use this instead of `tokio::spawn` for work that should run inside the
/// caller's transaction. A plain `tokio::spawn` task has no registry context:
/// its data operations use pooled connections and commit on their own, and
/// [`Client::start_transaction`](crate::db::Client::start_transaction) there
/// fails.
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(CONTEXT.scope(RefCell::new(snapshot()), fut))
}
