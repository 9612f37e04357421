use std::rc::Rc;
use std::time::Duration;

use sql_pipes::prelude::*;
use sql_pipes::test_utils::{MockDriver, run_local};
use sql_pipes::Acquire;

fn pipe_manager(driver: &MockDriver, connections: usize, waiting: usize) -> PipeManager {
    let config = PipesConfig::builder("127.0.0.1")
        .login("test", "test")
        .num_connections(connections)
        .waiting_list_size(waiting)
        .finish();
    PipeManager::new(&config, Rc::new(driver.clone())).expect("valid config")
}

/// One pipe and room for five waiters: of seven concurrent requests six are eventually served
/// and exactly one is refused on the spot.
#[tokio::test(start_paused = true)]
async fn waiting_list_is_bounded() -> Result<(), SqlPipesError> {
    run_local(async {
        let driver = MockDriver::new();
        let pm = pipe_manager(&driver, 1, 5);

        let acquires: Vec<Acquire> = (0..7).map(|_| pm.get(Role::Write)).collect();
        let refused: Vec<usize> = acquires
            .iter()
            .enumerate()
            .filter(|(_, acquire)| acquire.is_failed())
            .map(|(idx, _)| idx)
            .collect();
        assert_eq!(refused, vec![6]);
        assert_eq!(pm.waiting(), 5);

        let handles: Vec<_> = acquires
            .into_iter()
            .map(|acquire| {
                tokio::task::spawn_local(async move {
                    let lease = acquire.await?;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok::<u64, SqlPipesError>(lease.pipe().id())
                })
            })
            .collect();

        let (mut served, mut refused) = (0, 0);
        for handle in handles {
            match handle.await.expect("task panicked") {
                Ok(_) => served += 1,
                Err(err) if err.is_capacity() => refused += 1,
                Err(err) => return Err(err),
            }
        }
        assert_eq!((served, refused), (6, 1));
        assert_eq!(pm.waiting(), 0);
        // every request was served by reusing the one open pipe
        assert_eq!(driver.stats().connects, 2);
        Ok(())
    })
    .await
}

/// Requests are served in order within a role, and a blocked role does not hold back the other.
#[tokio::test(start_paused = true)]
async fn fifo_per_role_without_head_of_line_blocking() -> Result<(), SqlPipesError> {
    run_local(async {
        let driver = MockDriver::new();
        let pm = pipe_manager(&driver, 1, 5);
        let write = pm.get(Role::Write).await?;
        let read = pm.get(Role::Read).await?;

        let mut first_write = pm.get(Role::Write);
        let mut second_write = pm.get(Role::Write);
        let mut first_read = pm.get(Role::Read);
        assert_eq!(pm.waiting(), 3);

        drop(read);
        let read = tokio::time::timeout(Duration::from_millis(5), &mut first_read)
            .await
            .expect("read request should be served while writes wait")?;
        assert_eq!(read.pipe().role(), Role::Read);
        assert_eq!(pm.waiting(), 2);

        drop(write);
        let write = tokio::time::timeout(Duration::from_millis(5), &mut first_write)
            .await
            .expect("first write request should be served first")?;
        assert!(
            tokio::time::timeout(Duration::from_millis(5), &mut second_write)
                .await
                .is_err()
        );

        drop(write);
        let write = tokio::time::timeout(Duration::from_millis(5), &mut second_write)
            .await
            .expect("second write request should be served next")?;
        assert_eq!(write.pipe().role(), Role::Write);
        assert_eq!(pm.waiting(), 0);
        Ok(())
    })
    .await
}

/// A withdrawn request frees its slot on the waiting list.
#[tokio::test(start_paused = true)]
async fn cancelled_requests_leave_the_waiting_list() -> Result<(), SqlPipesError> {
    run_local(async {
        let driver = MockDriver::new();
        let pm = pipe_manager(&driver, 1, 1);
        let _held = pm.get(Role::Read).await?;

        let mut waiting = pm.get(Role::Read);
        assert!(pm.get(Role::Read).is_failed());
        waiting.cancel();
        assert_eq!(pm.waiting(), 0);
        assert!(waiting.await.unwrap_err().is_cancelled());
        assert!(pm.get(Role::Read).is_waiting());
        Ok(())
    })
    .await
}

/// Closed pipes are reopened on demand, in pool order.
#[tokio::test(start_paused = true)]
async fn closed_pipes_reopen_on_acquisition() -> Result<(), SqlPipesError> {
    run_local(async {
        let driver = MockDriver::new();
        let pm = pipe_manager(&driver, 3, 5);
        let first = pm.get(Role::Write).await?;
        let second = pm.get(Role::Write).await?;
        assert_eq!(
            (first.pipe().id(), second.pipe().id()),
            (pm.pipes(Role::Write)[0].id(), pm.pipes(Role::Write)[1].id())
        );

        pm.close();
        assert!(pm.pipes(Role::Write).iter().all(|p| p.in_state(PipeState::Closed)));
        drop((first, second));

        let again = pm.get(Role::Write).await?;
        assert_eq!(again.pipe().id(), pm.pipes(Role::Write)[0].id());
        assert!(again.pipe().in_state(PipeState::Idle));
        Ok(())
    })
    .await
}
