//! Helpers for tests and benchmarks: an in-memory scripted driver and a `LocalSet` runner.

mod mock;

use std::future::Future;

use tokio::task::LocalSet;

pub use mock::{MockDriver, MockReply, MockStats};

/// Run `future` inside a fresh [`LocalSet`], as every pool operation requires.
pub async fn run_local<F: Future>(future: F) -> F::Output {
    LocalSet::new().run_until(future).await
}
