//! Integration tests for transaction scopes on SQLite.

mod common;

use common::{count, pooled, setup_db};
use scoped_db::config::PoolOptions;
use scoped_db::db::{spawn, task_scope};
use scoped_db::error::DbError;
use scoped_db::models::{TransactionState, Value};
use std::time::Duration;

#[tokio::test]
async fn test_commit_persists_rows() {
    let db = setup_db("commit", PoolOptions::default()).await;
    let client = &db.client;

    let result: Result<(), DbError> = client
        .atomic(|_tx| async {
            client
                .execute_insert(
                    "INSERT INTO authors (name) VALUES (?)",
                    &[Value::from("Ursula")],
                )
                .await?;
            Ok(())
        })
        .await;
    result.unwrap();

    assert_eq!(count(client, "authors").await, 1);
    assert_eq!(client.active_transactions(), 0);
}

#[tokio::test]
async fn test_error_rolls_back_dependent_rows() {
    let db = setup_db("rollback", PoolOptions::default()).await;
    let client = &db.client;

    let result: Result<(), DbError> = client
        .atomic(|_tx| async {
            let author = client
                .execute_insert(
                    "INSERT INTO authors (name) VALUES (?) RETURNING id",
                    &[Value::from("Iain")],
                )
                .await?
                .unwrap();
            let author_id = author.get_i64("id").unwrap();
            client
                .execute_insert(
                    "INSERT INTO books (author_id, title) VALUES (?, ?)",
                    &[Value::from(author_id), Value::from("Excession")],
                )
                .await?;
            Err(DbError::params("abort before completion"))
        })
        .await;

    assert!(matches!(result, Err(DbError::Params { .. })));
    assert_eq!(count(client, "authors").await, 0);
    assert_eq!(count(client, "books").await, 0);
    assert_eq!(client.active_transactions(), 0);
}

#[tokio::test]
async fn test_statement_error_rolls_back_and_propagates() {
    let db = setup_db("stmt_error", PoolOptions::default()).await;
    let client = &db.client;

    let result: Result<(), DbError> = client
        .atomic(|_tx| async {
            client
                .execute_insert(
                    "INSERT INTO authors (name) VALUES (?)",
                    &[Value::from("dup")],
                )
                .await?;
            client
                .execute_insert(
                    "INSERT INTO authors (name) VALUES (?)",
                    &[Value::from("dup")],
                )
                .await?;
            Ok(())
        })
        .await;

    assert!(matches!(result, Err(DbError::Integrity { .. })));
    assert_eq!(count(client, "authors").await, 0);
}

#[tokio::test]
async fn test_manual_commit_twice_fails() {
    let db = setup_db("commit_twice", PoolOptions::default()).await;
    let client = db.client.clone();

    task_scope(async move {
        let tx = client.start_transaction().await.unwrap();
        assert_eq!(tx.state(), TransactionState::Started);
        client
            .execute_insert("INSERT INTO authors (name) VALUES ('a')", &[])
            .await
            .unwrap();

        tx.commit().await.unwrap();
        assert!(tx.is_finalized());

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, DbError::TransactionManagement { .. }));
        let err = tx.rollback().await.unwrap_err();
        assert!(matches!(err, DbError::TransactionManagement { .. }));
        let err = tx.finalize().await.unwrap_err();
        assert!(matches!(err, DbError::TransactionManagement { .. }));

        assert_eq!(count(&client, "authors").await, 1);
        assert_eq!(client.active_transactions(), 0);
    })
    .await;
}

#[tokio::test]
async fn test_finalize_before_start_fails() {
    let db = setup_db("finalize_early", PoolOptions::default()).await;
    let tx = db.client.in_transaction();

    let err = tx.finalize().await.unwrap_err();
    assert!(matches!(err, DbError::Operational { .. }));
    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, DbError::Operational { .. }));
    assert_eq!(tx.state(), TransactionState::Created);
}

#[tokio::test]
async fn test_start_twice_fails() {
    let db = setup_db("start_twice", PoolOptions::default()).await;
    let client = db.client.clone();

    task_scope(async move {
        let tx = client.start_transaction().await.unwrap();
        let err = tx.start().await.unwrap_err();
        assert!(matches!(err, DbError::Operational { .. }));
        tx.rollback().await.unwrap();

        let err = tx.start().await.unwrap_err();
        assert!(matches!(err, DbError::Operational { .. }));
    })
    .await;
}

#[tokio::test]
async fn test_start_outside_task_context_fails() {
    let db = setup_db("no_context", PoolOptions::default()).await;

    let err = db.client.start_transaction().await.unwrap_err();
    assert!(matches!(err, DbError::Operational { .. }));
    assert_eq!(db.client.active_transactions(), 0);
}

#[tokio::test]
async fn test_statements_route_through_current_transaction() {
    let db = setup_db("routing", PoolOptions::default()).await;
    let client = db.client.clone();

    task_scope(async move {
        assert!(client.current_transaction().is_none());
        let tx = client.start_transaction().await.unwrap();

        let current = client.current_transaction().unwrap();
        assert!(current.ptr_eq(&tx));
        assert_eq!(client.current_source().transaction().unwrap().id(), tx.id());

        client
            .execute_insert("INSERT INTO authors (name) VALUES ('pending')", &[])
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert!(client.current_transaction().is_none());
        assert_eq!(count(&client, "authors").await, 0);
    })
    .await;
}

#[tokio::test]
async fn test_nested_scopes_share_connection() {
    let db = setup_db("nested_share", PoolOptions::default()).await;
    let client = &db.client;

    let result: Result<(), DbError> = client
        .atomic(|outer| async move {
            client
                .atomic(|inner| {
                    let outer = outer.clone();
                    async move {
                        assert_eq!(inner.depth(), 1);
                        assert!(inner.parent().unwrap().ptr_eq(&outer));
                        assert!(inner.shares_connection_with(&outer));
                        assert!(client.current_transaction().unwrap().ptr_eq(&inner));
                        Ok::<_, DbError>(())
                    }
                })
                .await?;
            assert!(client.current_transaction().unwrap().ptr_eq(&outer));
            Ok(())
        })
        .await;
    result.unwrap();
    assert_eq!(client.active_transactions(), 0);
}

#[tokio::test]
async fn test_nested_rollback_keeps_outer_work() {
    let db = setup_db("nested_rollback", PoolOptions::default()).await;
    let client = &db.client;

    let result: Result<(), DbError> = client
        .atomic(|_outer| async {
            client
                .execute_insert("INSERT INTO authors (name) VALUES ('kept')", &[])
                .await?;

            let inner: Result<(), DbError> = client
                .atomic(|_inner| async {
                    client
                        .execute_insert("INSERT INTO authors (name) VALUES ('discarded')", &[])
                        .await?;
                    Err(DbError::params("inner failure"))
                })
                .await;
            assert!(inner.is_err());
            Ok(())
        })
        .await;
    result.unwrap();

    let rows = client
        .execute_query("SELECT name FROM authors ORDER BY id")
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_str("name"), Some("kept"));
}

#[tokio::test]
async fn test_outer_rollback_discards_nested_commit() {
    let db = setup_db("outer_rollback", PoolOptions::default()).await;
    let client = &db.client;

    let result: Result<(), DbError> = client
        .atomic(|_outer| async {
            client
                .atomic(|_inner| async {
                    client
                        .execute_insert("INSERT INTO authors (name) VALUES ('inner')", &[])
                        .await?;
                    Ok::<_, DbError>(())
                })
                .await?;
            Err(DbError::params("outer failure"))
        })
        .await;

    assert!(result.is_err());
    assert_eq!(count(client, "authors").await, 0);
}

#[tokio::test]
async fn test_management_error_exit_only_finalizes() {
    let db = setup_db("tme_exit", PoolOptions::default()).await;
    let client = &db.client;

    let result: Result<(), DbError> = client
        .atomic(|tx| async move {
            client
                .execute_insert("INSERT INTO authors (name) VALUES ('early')", &[])
                .await?;
            tx.commit().await?;
            // second terminating command inside the body
            tx.commit().await?;
            Ok(())
        })
        .await;

    assert!(matches!(result, Err(DbError::TransactionManagement { .. })));
    assert_eq!(count(client, "authors").await, 1);
    assert_eq!(client.active_transactions(), 0);
}

#[tokio::test]
async fn test_operations_after_finalize_fail() {
    let db = setup_db("after_finalize", PoolOptions::default()).await;
    let client = db.client.clone();

    task_scope(async move {
        let tx = client.start_transaction().await.unwrap();
        tx.commit().await.unwrap();

        let err = tx
            .source()
            .execute_query("SELECT 1")
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::TransactionManagement { .. }));
    })
    .await;
}

#[tokio::test]
async fn test_tasks_do_not_see_each_others_transaction() {
    let db = setup_db("isolation", pooled(4)).await;
    let client = db.client.clone();

    let (started_tx, started_rx) = tokio::sync::oneshot::channel();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();

    let holder = {
        let client = client.clone();
        spawn(async move {
            let tx = client.start_transaction().await.unwrap();
            started_tx.send(tx.id().to_string()).unwrap();
            done_rx.await.unwrap();
            tx.rollback().await.unwrap();
        })
    };

    let id = started_rx.await.unwrap();
    assert!(!id.is_empty());

    let observer = {
        let client = client.clone();
        spawn(async move { client.current_transaction().is_none() })
    };
    assert!(observer.await.unwrap());
    assert!(client.current_transaction().is_none());
    assert_eq!(client.active_transactions(), 1);

    done_tx.send(()).unwrap();
    holder.await.unwrap();
    assert_eq!(client.active_transactions(), 0);
}

#[tokio::test]
async fn test_spawned_task_inherits_transaction() {
    let db = setup_db("inherit", PoolOptions::default()).await;
    let client = &db.client;

    let result: Result<(), DbError> = client
        .atomic(|tx| async move {
            let child = {
                let client = client.clone();
                spawn(async move {
                    let current = client.current_transaction();
                    client
                        .execute_insert("INSERT INTO authors (name) VALUES ('child')", &[])
                        .await
                        .map(|_| current.map(|scope| scope.id().to_string()))
                })
            };
            let seen = child.await.unwrap()?;
            assert_eq!(seen.as_deref(), Some(tx.id()));
            Err(DbError::params("roll it all back"))
        })
        .await;

    assert!(result.is_err());
    assert_eq!(count(client, "authors").await, 0);
}

#[tokio::test]
async fn test_transaction_info() {
    let db = setup_db("info", PoolOptions::default()).await;
    let client = db.client.clone();

    task_scope(async move {
        let tx = client.in_transaction();
        let info = tx.info();
        assert_eq!(info.state, TransactionState::Created);
        assert!(info.started_at.is_none());

        tx.start().await.unwrap();
        let info = tx.info();
        assert!(info.id.starts_with("tx_"));
        assert_eq!(info.connection_name, "info");
        assert_eq!(info.depth, 0);
        assert_eq!(info.state, TransactionState::Started);
        assert!(info.started_at.is_some());
        tx.commit().await.unwrap();
        assert_eq!(tx.info().state, TransactionState::Finalized);
    })
    .await;
}

#[tokio::test]
async fn test_dropped_scope_releases_connection() {
    let db = setup_db("dropped", PoolOptions::default()).await;
    let client = db.client.clone();

    task_scope(async {
        let tx = client.start_transaction().await.unwrap();
        client
            .execute_insert("INSERT INTO authors (name) VALUES ('lost')", &[])
            .await
            .unwrap();
        drop(tx);
    })
    .await;

    // the registry context ended, the scope was dropped and its connection closed
    assert_eq!(client.active_transactions(), 0);
    assert_eq!(count(&client, "authors").await, 0);
}

#[tokio::test]
async fn test_cancelled_commit_can_still_finalize() {
    let db = setup_db("cancelled_commit", PoolOptions::default()).await;
    let client = db.client.clone();

    task_scope(async {
        let tx = client.start_transaction().await.unwrap();
        tx.source()
            .execute_insert("INSERT INTO authors (name) VALUES ('uncommitted')", &[])
            .await
            .unwrap();

        // the held lease keeps COMMIT waiting for the connection lock
        let lease = tx.source().acquire().await.unwrap();
        let cancelled = tokio::time::timeout(Duration::from_millis(100), tx.commit()).await;
        assert!(cancelled.is_err());
        assert_eq!(tx.state(), TransactionState::Started);
        drop(lease);

        tx.finalize().await.unwrap();
        assert!(tx.is_finalized());
        assert!(client.current_transaction().is_none());
    })
    .await;

    assert_eq!(client.active_transactions(), 0);
    // the connection was closed with its transaction still open
    assert_eq!(count(&client, "authors").await, 0);
}

#[tokio::test]
async fn test_cancelled_commit_can_be_rolled_back() {
    let db = setup_db("cancelled_then_rollback", PoolOptions::default()).await;
    let client = db.client.clone();

    task_scope(async {
        let tx = client.start_transaction().await.unwrap();
        client
            .execute_insert("INSERT INTO authors (name) VALUES ('discarded')", &[])
            .await
            .unwrap();

        let lease = tx.source().acquire().await.unwrap();
        let cancelled = tokio::time::timeout(Duration::from_millis(100), tx.commit()).await;
        assert!(cancelled.is_err());
        drop(lease);

        tx.rollback().await.unwrap();
        assert!(tx.is_finalized());
    })
    .await;

    assert_eq!(client.active_transactions(), 0);
    assert_eq!(count(&client, "authors").await, 0);
}

#[tokio::test]
async fn test_cancelled_start_can_be_retried() {
    let db = setup_db("cancelled_start", PoolOptions::default()).await;
    let client = db.client.clone();

    task_scope(async {
        // the only pooled connection, so start waits in acquire
        let held = client.acquire_connection().await.unwrap();
        let tx = client.in_transaction();
        let cancelled = tokio::time::timeout(Duration::from_millis(100), tx.start()).await;
        assert!(cancelled.is_err());
        assert_eq!(tx.state(), TransactionState::Created);
        assert!(client.current_transaction().is_none());
        drop(held);

        tx.start().await.unwrap();
        assert_eq!(client.active_transactions(), 1);
        tx.rollback().await.unwrap();
    })
    .await;

    assert_eq!(client.active_transactions(), 0);
}

#[tokio::test]
async fn test_cancelled_atomic_body_commits_nothing() {
    let db = setup_db("cancelled_body", PoolOptions::default()).await;
    let client = &db.client;

    let cancelled = tokio::time::timeout(
        Duration::from_millis(200),
        client.atomic(|_tx| async {
            client
                .execute_insert("INSERT INTO authors (name) VALUES ('abandoned')", &[])
                .await?;
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, DbError>(())
        }),
    )
    .await;
    assert!(cancelled.is_err());

    assert_eq!(client.active_transactions(), 0);
    assert_eq!(count(client, "authors").await, 0);

    // the pinned connection was closed, so its write lock is gone
    client
        .execute_insert("INSERT INTO authors (name) VALUES ('fresh')", &[])
        .await
        .unwrap();
    assert_eq!(count(client, "authors").await, 1);
}

#[tokio::test]
async fn test_plain_tokio_spawn_runs_outside_transaction() {
    let db = setup_db("plain_spawn", PoolOptions::default()).await;
    let client = &db.client;

    let result: Result<(), DbError> = client
        .atomic(|_tx| async {
            let detached = {
                let client = client.clone();
                tokio::spawn(async move {
                    let sees_transaction = client.current_transaction().is_some();
                    let start = client.start_transaction().await;
                    (sees_transaction, start.err())
                })
            };
            let (sees_transaction, start_err) = detached.await.unwrap();
            assert!(!sees_transaction);
            assert!(matches!(start_err, Some(DbError::Operational { .. })));
            Ok(())
        })
        .await;
    result.unwrap();
    assert_eq!(client.active_transactions(), 0);
}
