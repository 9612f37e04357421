use std::rc::Rc;
use std::time::Duration;

use sql_pipes::prelude::*;
use sql_pipes::test_utils::{MockDriver, MockReply, run_local};

fn connection(driver: &MockDriver, connections: usize) -> Connection {
    let config = PipesConfig::builder("127.0.0.1")
        .login("test", "test")
        .database("shop")
        .num_connections(connections)
        .finish();
    Connection::new(config, Rc::new(driver.clone())).expect("valid config")
}

/// Statements tagged with a transaction run on its pinned pipe, untagged writes go elsewhere,
/// and a successful commit hands the pipe back to the pool open.
#[tokio::test(start_paused = true)]
async fn commit_unpins_the_pipe() -> Result<(), SqlPipesError> {
    run_local(async {
        let driver = MockDriver::new();
        let conn = connection(&driver, 2);

        let tx = conn.begin_transaction(None).await?;
        let pinned = tx.pipe().expect("active transaction has a pipe");
        assert!(pinned.is_pinned());
        assert_eq!(pinned.role(), Role::Write);

        let in_tx = conn
            .execute(
                "update stock set qty = qty - ? where id = ?",
                &[RowValues::Int(1), RowValues::Int(9)],
                Some(QueryOption::new().with_transaction(&tx)),
            )
            .await?;
        assert_eq!(in_tx.pipe().id(), pinned.id());

        let outside = conn.execute("update audit set seen = 1", &[], None).await?;
        assert_ne!(outside.pipe().id(), pinned.id());

        assert!(conn.commit(&tx).await?);
        assert!(!tx.is_active());
        assert!(!pinned.is_pinned());
        assert_eq!(pinned.state(), PipeState::Idle);

        let statements = driver.stats().statements;
        assert_eq!(
            statements,
            vec![
                "START TRANSACTION",
                "update stock set qty = qty - 1 where id = 9",
                "update audit set seen = 1",
                "COMMIT",
            ]
        );
        Ok(())
    })
    .await
}

/// Commit and rollback of a closed transaction fail without sending anything to the server.
#[tokio::test(start_paused = true)]
async fn closed_transaction_rejects_commit_and_rollback() -> Result<(), SqlPipesError> {
    run_local(async {
        let driver = MockDriver::new();
        let conn = connection(&driver, 1);

        let tx = conn.begin_transaction(None).await?;
        assert!(conn.rollback(&tx).await?);
        let sent = driver.stats().statements.len();

        let commit = conn.commit(&tx).await.unwrap_err();
        assert!(commit.is_transaction_state(), "unexpected error {commit:?}");
        let rollback = conn.rollback(&tx).await.unwrap_err();
        assert!(rollback.is_transaction_state(), "unexpected error {rollback:?}");

        let tagged = conn
            .statement("delete from cart", &[], Some(QueryOption::new().with_transaction(&tx)))
            .await
            .unwrap_err();
        assert!(tagged.is_transaction_state(), "unexpected error {tagged:?}");

        assert_eq!(driver.stats().statements.len(), sent);
        Ok(())
    })
    .await
}

/// A transaction left open past its deadline is abandoned: the pipe is force-closed and a late
/// commit is refused.
#[tokio::test(start_paused = true)]
async fn deadline_abandons_the_transaction() -> Result<(), SqlPipesError> {
    run_local(async {
        let driver = MockDriver::new();
        let conn = connection(&driver, 1);

        let tx = conn.begin_transaction(Some(Duration::from_secs(2))).await?;
        let pipe = tx.pipe().expect("active transaction has a pipe");
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(!tx.is_active());
        assert_eq!(pipe.state(), PipeState::Closed);
        assert_eq!(driver.stats().kills, 1);

        let err = conn.commit(&tx).await.unwrap_err();
        assert!(err.is_transaction_state(), "unexpected error {err:?}");

        // the pool reopens the pipe for ordinary work
        assert!(conn.statement("update a set b = 1", &[], None).await?);
        assert_eq!(pipe.state(), PipeState::Idle);
        Ok(())
    })
    .await
}

/// A failed commit ends the transaction and closes its pipe.
#[tokio::test(start_paused = true)]
async fn failed_commit_closes_the_pipe() -> Result<(), SqlPipesError> {
    run_local(async {
        let driver = MockDriver::new();
        driver.reply_with(|sql| {
            if sql == "COMMIT" {
                MockReply::error(1213, "Deadlock found when trying to get lock")
            } else {
                MockReply::affected(0, 0)
            }
        });
        let conn = connection(&driver, 1);

        let tx = conn.begin_transaction(None).await?;
        let pipe = tx.pipe().expect("active transaction has a pipe");
        let err = conn.commit(&tx).await.unwrap_err();
        assert!(matches!(err.cause(), SqlPipesError::Statement { code: 1213, .. }));
        assert!(!tx.is_active());
        assert_eq!(pipe.state(), PipeState::Closed);
        Ok(())
    })
    .await
}

/// While a transaction holds the only write pipe, untagged writes wait and tagged statements
/// queue behind each other on the pinned pipe.
#[tokio::test(start_paused = true)]
async fn pinned_pipe_serves_only_its_transaction() -> Result<(), SqlPipesError> {
    run_local(async {
        let driver = MockDriver::new();
        driver.reply_with(|sql| {
            if sql.starts_with("update") {
                MockReply::affected(0, 1).after(Duration::from_secs(1))
            } else {
                MockReply::affected(0, 0)
            }
        });
        let conn = connection(&driver, 1);
        let tx = conn.begin_transaction(None).await?;
        let in_tx = QueryOption::new().with_transaction(&tx);

        let first = conn.update("update a set n = 1", &[], Some(in_tx.clone()));
        let second = conn.update("update a set n = 2", &[], Some(in_tx));
        let mut outside = Box::pin(conn.update("update b set n = 3", &[], None));
        assert_eq!(conn.pipe_manager().waiting(), 2);

        assert_eq!(first.await?, 1);
        assert_eq!(second.await?, 1);
        assert!(
            tokio::time::timeout(Duration::from_secs(5), &mut outside)
                .await
                .is_err(),
            "untagged write must not reach the pinned pipe"
        );

        conn.commit(&tx).await?;
        assert_eq!(outside.await?, 1);
        Ok(())
    })
    .await
}

/// Closing a transaction explicitly or dropping its last handle discards the pipe's session.
#[tokio::test(start_paused = true)]
async fn abandoned_transactions_close_their_pipe() -> Result<(), SqlPipesError> {
    run_local(async {
        let driver = MockDriver::new();
        let conn = connection(&driver, 2);

        let closed = conn.begin_transaction(None).await?;
        let closed_pipe = closed.pipe().expect("active transaction has a pipe");
        conn.close_transaction(&closed);
        assert!(!closed.is_active());
        assert_eq!(closed_pipe.state(), PipeState::Closed);

        let dropped = conn.begin_transaction(None).await?;
        let dropped_pipe = dropped.pipe().expect("active transaction has a pipe");
        drop(dropped);
        assert_eq!(dropped_pipe.state(), PipeState::Closed);
        assert!(!dropped_pipe.is_pinned());
        assert_eq!(driver.stats().kills, 2);
        Ok(())
    })
    .await
}

/// A pinned pipe that fails its health ping while idle is closed, and its transaction with it.
#[tokio::test(start_paused = true)]
async fn failed_ping_abandons_the_pinned_transaction() -> Result<(), SqlPipesError> {
    run_local(async {
        let driver = MockDriver::new();
        let conn = connection(&driver, 1);

        let tx = conn.begin_transaction(None).await?;
        let pipe = tx.pipe().expect("active transaction has a pipe");
        conn.set_ping_debounce(Duration::from_secs(1));
        driver.set_ping_ok(false);

        // periodic check at 10s, run after the 1s window
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(!tx.is_active());
        assert_eq!(pipe.state(), PipeState::Closed);
        assert!(!pipe.is_pinned());

        let sent = driver.stats().statements.len();
        let err = conn.commit(&tx).await.unwrap_err();
        assert!(err.is_transaction_state(), "unexpected error {err:?}");
        assert_eq!(driver.stats().statements.len(), sent);
        Ok(())
    })
    .await
}

/// Statements tagged with a transaction share the waiting list and its capacity.
#[tokio::test(start_paused = true)]
async fn transaction_requests_respect_waiting_list_capacity() -> Result<(), SqlPipesError> {
    run_local(async {
        let driver = MockDriver::new();
        let config = PipesConfig::builder("127.0.0.1")
            .login("test", "test")
            .num_connections(1)
            .waiting_list_size(2)
            .finish();
        let conn = Connection::new(config, Rc::new(driver.clone()))?;
        let tx = conn.begin_transaction(None).await?;
        let in_tx = QueryOption::new().with_transaction(&tx);

        let running = conn.update("update a set n = 1", &[], Some(in_tx.clone()));
        let queued_in_tx = conn.update("update a set n = 2", &[], Some(in_tx.clone()));
        let queued_outside = conn.update("update b set n = 3", &[], None);
        assert_eq!(conn.pipe_manager().waiting(), 2);

        let err = conn
            .update("update a set n = 4", &[], Some(in_tx))
            .await
            .unwrap_err();
        assert!(err.is_capacity(), "unexpected error {err:?}");
        assert!(matches!(err, SqlPipesError::Query { .. }));

        assert_eq!(running.await?, 1);
        assert_eq!(queued_in_tx.await?, 1);
        assert!(conn.commit(&tx).await?);
        assert_eq!(queued_outside.await?, 1);
        Ok(())
    })
    .await
}
