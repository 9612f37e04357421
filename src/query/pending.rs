use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::SqlPipesError;
use crate::results::QueryResult;

type LocalFuture = Pin<Box<dyn Future<Output = Result<QueryResult, SqlPipesError>>>>;

/// Outcome of [`crate::QueryManager::execute`].
///
/// The pipe was already requested when this was created; awaiting drives the statement to
/// completion. Cancelling or dropping it before it settles force-closes the pipe the statement
/// runs on, or withdraws the request if no pipe was handed out yet.
pub struct PendingQuery {
    state: PendingState,
}

enum PendingState {
    Running(LocalFuture),
    Cancelled,
    Finished,
}

impl PendingQuery {
    pub(crate) fn new(future: LocalFuture) -> Self {
        Self {
            state: PendingState::Running(future),
        }
    }

    /// Abort the statement. Awaiting afterwards yields [`SqlPipesError::Cancelled`].
    pub fn cancel(&mut self) {
        if matches!(self.state, PendingState::Running(_)) {
            tracing::debug!("query cancelled");
            // dropping the future releases or force-closes whatever it holds
            self.state = PendingState::Cancelled;
        }
    }

    /// Whether the future has produced its output.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self.state, PendingState::Finished)
    }
}

impl Future for PendingQuery {
    type Output = Result<QueryResult, SqlPipesError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let output = match &mut this.state {
            PendingState::Running(future) => match future.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(output) => output,
            },
            PendingState::Cancelled => Err(SqlPipesError::Cancelled),
            PendingState::Finished => Err(SqlPipesError::Usage(
                "query outcome was already taken".into(),
            )),
        };
        this.state = PendingState::Finished;
        Poll::Ready(output)
    }
}

impl fmt::Debug for PendingQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            PendingState::Running(_) => "running",
            PendingState::Cancelled => "cancelled",
            PendingState::Finished => "finished",
        };
        f.debug_struct("PendingQuery").field("state", &state).finish()
    }
}
