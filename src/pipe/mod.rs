mod lease;
mod state;

use std::cell::{RefCell, RefMut};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;

pub use lease::PipeLease;
pub use state::PipeState;
use state::StateClock;

use crate::binding::bind_placeholders;
use crate::driver::{Credential, Driver, Link, Outcome};
use crate::error::SqlPipesError;
use crate::results::QueryResult;
use crate::transaction::{Transaction, WeakTransaction};
use crate::types::{RowValues, Role};

type PendingOutcome = oneshot::Sender<Result<QueryResult, SqlPipesError>>;

/// One physical connection plus its execution state.
///
/// Pipes are created once per configured slot and live as long as their pool, cycling
/// `Closed -> Idle -> Working -> Idle` and back to `Closed` whenever they are force-closed.
pub struct Pipe {
    id: u64,
    role: Role,
    credential: Credential,
    driver: Rc<dyn Driver>,
    inner: RefCell<PipeInner>,
}

struct PipeInner {
    clock: StateClock,
    link: Option<Box<dyn Link>>,
    pending: Option<PendingOutcome>,
    transaction: Option<WeakTransaction>,
    leased: bool,
}

impl Pipe {
    #[must_use]
    pub fn new(id: u64, role: Role, credential: Credential, driver: Rc<dyn Driver>) -> Self {
        Self {
            id,
            role,
            credential,
            driver,
            inner: RefCell::new(PipeInner {
                clock: StateClock::new(),
                link: None,
                pending: None,
                transaction: None,
                leased: false,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    #[must_use]
    pub fn state(&self) -> PipeState {
        self.inner.borrow().clock.state()
    }

    #[must_use]
    pub fn in_state(&self, state: PipeState) -> bool {
        self.state() == state
    }

    /// How long the pipe has been in its current state.
    #[must_use]
    pub fn state_duration(&self) -> Duration {
        self.inner.borrow().clock.elapsed()
    }

    /// Whether a lease is outstanding on this pipe.
    #[must_use]
    pub fn is_leased(&self) -> bool {
        self.inner.borrow().leased
    }

    /// The transaction this pipe is pinned to, if any.
    #[must_use]
    pub fn transaction(&self) -> Option<Transaction> {
        self.inner
            .borrow()
            .transaction
            .as_ref()
            .and_then(WeakTransaction::upgrade)
    }

    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.transaction().is_some()
    }

    /// Idle, unleased and not pinned: free for any acquisition of this role.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.in_state(PipeState::Idle) && !self.is_leased() && !self.is_pinned()
    }

    pub(crate) fn is_reopenable(&self) -> bool {
        self.in_state(PipeState::Closed) && !self.is_leased() && !self.is_pinned()
    }

    pub(crate) fn set_leased(&self, leased: bool) {
        self.inner.borrow_mut().leased = leased;
    }

    pub(crate) fn set_transaction(&self, transaction: Option<WeakTransaction>) {
        self.inner.borrow_mut().transaction = transaction;
    }

    /// Open the link if the pipe is closed.
    ///
    /// Returns true when the pipe ends up idle. Failures are logged and leave the pipe closed;
    /// a working pipe cannot be reopened.
    pub fn open(&self) -> bool {
        match self.state() {
            PipeState::Idle => return true,
            PipeState::Working => return false,
            PipeState::Closed => {}
        }

        let credential = &self.credential;
        let mut link = match self.driver.connect(credential) {
            Ok(link) => link,
            Err(err) => {
                tracing::error!(
                    pipe = self.id,
                    host = %credential.host,
                    code = err.code,
                    "failed to open pipe: {}",
                    err.message
                );
                return false;
            }
        };
        if let Err(err) = link.set_charset(&credential.charset, &credential.collation) {
            tracing::error!(
                pipe = self.id,
                code = err.code,
                "failed to set charset {} collate {}: {}",
                credential.charset,
                credential.collation,
                err.message
            );
            link.kill();
            return false;
        }

        let thread_id = link.thread_id();
        let mut inner = self.inner.borrow_mut();
        inner.link = Some(link);
        inner.clock.transition(PipeState::Idle);
        tracing::debug!(pipe = self.id, thread_id, role = %self.role, "pipe opened");
        true
    }

    /// Force the pipe closed.
    ///
    /// Aborts whatever is running, rejects the pending outcome, and closes the transaction
    /// pinned to this pipe. Closing a closed pipe does nothing.
    pub fn close(&self) {
        let (was, link, pending, transaction) = {
            let mut inner = self.inner.borrow_mut();
            let was = inner.clock.state();
            let link = inner.link.take();
            let pending = inner.pending.take();
            let transaction = inner.transaction.take();
            inner.clock.transition(PipeState::Closed);
            (was, link, pending, transaction)
        };

        if let Some(mut link) = link {
            link.kill();
        }
        if let Some(pending) = pending {
            let _ = pending.send(Err(SqlPipesError::Pipe(format!(
                "pipe:{} is forced to close",
                self.id
            ))));
        }
        if let Some(transaction) = transaction.as_ref().and_then(WeakTransaction::upgrade) {
            transaction.close();
        }
        if was != PipeState::Closed {
            tracing::debug!(pipe = self.id, "pipe:{} closed", self.id);
        }
    }

    /// Liveness probe. False when closed or when the probe fails.
    pub fn ping(&self) -> bool {
        match self.inner.borrow_mut().link.as_mut() {
            Some(link) => link.ping(),
            None => false,
        }
    }

    /// Start `sql` with `bindings` spliced into its `?` placeholders.
    ///
    /// The pipe must be idle. On success it is working until the returned future settles,
    /// after which it is idle again.
    ///
    /// # Errors
    /// [`SqlPipesError::Pipe`] when the pipe is not idle or the statement could not be sent
    /// (the pipe is closed in that case); [`SqlPipesError::InvalidArgument`] when the bindings
    /// do not match the placeholders.
    pub fn query(
        self: &Rc<Self>,
        sql: &str,
        bindings: &[RowValues],
    ) -> Result<PipeQuery, SqlPipesError> {
        let mut inner = self.inner.borrow_mut();
        if inner.clock.state() != PipeState::Idle {
            return Err(SqlPipesError::Pipe(format!(
                "pipe:{} is not ready for query",
                self.id
            )));
        }

        let started = {
            let Some(link) = inner.link.as_mut() else {
                return Err(SqlPipesError::Pipe(format!(
                    "pipe:{} has no open link",
                    self.id
                )));
            };
            let sql = bind_placeholders(sql, bindings, &|value| link.escape(value))?;
            link.start(&sql)
        };

        if let Err(err) = started {
            drop(inner);
            tracing::warn!(pipe = self.id, code = err.code, "failed to start statement");
            self.close();
            return Err(SqlPipesError::Pipe(format!(
                "pipe:{} failed to start statement: {err}",
                self.id
            )));
        }

        let (sender, receiver) = oneshot::channel();
        inner.pending = Some(sender);
        inner.clock.transition(PipeState::Working);
        Ok(PipeQuery {
            pipe_id: self.id,
            receiver,
        })
    }

    /// Settle the pending statement with a successful outcome.
    pub fn resolve(self: &Rc<Self>, outcome: Outcome) {
        let result = match outcome {
            Outcome::Rows(source) => QueryResult::with_rows(Rc::clone(self), source),
            Outcome::Affected {
                insert_id,
                affected_rows,
            } => QueryResult::with_execution(Rc::clone(self), insert_id, affected_rows),
        };
        self.settle(Ok(result));
    }

    /// Settle the pending statement with an error.
    pub fn reject(&self, error: SqlPipesError) {
        self.settle(Err(error));
    }

    /// Fetch the outcome of a finished statement and settle with it.
    pub(crate) fn reap(self: &Rc<Self>) {
        let reaped = match self.inner.borrow_mut().link.as_mut() {
            Some(link) => link.reap(),
            None => return,
        };
        match reaped {
            Ok(outcome) => self.resolve(outcome),
            Err(err) => self.reject(SqlPipesError::Statement {
                code: err.code,
                message: err.message,
            }),
        }
    }

    /// Settle with the link's last recorded error.
    pub(crate) fn reject_with_link_error(&self) {
        let err = match self.inner.borrow().link.as_ref() {
            Some(link) => link.last_error(),
            None => return,
        };
        self.reject(SqlPipesError::Statement {
            code: err.code,
            message: err.message,
        });
    }

    /// Mutable access to the open link, for the completion poller.
    pub(crate) fn link_mut(&self) -> Option<RefMut<'_, Box<dyn Link>>> {
        RefMut::filter_map(self.inner.borrow_mut(), |inner| inner.link.as_mut()).ok()
    }

    fn settle(&self, result: Result<QueryResult, SqlPipesError>) {
        let pending = {
            let mut inner = self.inner.borrow_mut();
            let pending = inner.pending.take();
            if pending.is_some() {
                inner.clock.transition(PipeState::Idle);
            }
            pending
        };
        match pending {
            Some(pending) => {
                let _ = pending.send(result);
            }
            None => tracing::warn!(pipe = self.id, "settled a pipe with no pending statement"),
        }
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Pipe")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("host", &self.credential.host)
            .field("state", &inner.clock.state())
            .field("leased", &inner.leased)
            .field("pinned", &inner.transaction.is_some())
            .finish()
    }
}

/// Pending outcome of a statement started with [`Pipe::query`].
#[derive(Debug)]
pub struct PipeQuery {
    pipe_id: u64,
    receiver: oneshot::Receiver<Result<QueryResult, SqlPipesError>>,
}

impl PipeQuery {
    #[must_use]
    pub fn pipe_id(&self) -> u64 {
        self.pipe_id
    }
}

impl Future for PipeQuery {
    type Output = Result<QueryResult, SqlPipesError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let pipe_id = self.pipe_id;
        Pin::new(&mut self.receiver).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(SqlPipesError::Pipe(format!(
                    "pipe:{pipe_id} dropped its pending statement"
                )))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockDriver, MockReply, run_local};

    fn pipe(driver: &MockDriver) -> Rc<Pipe> {
        Rc::new(Pipe::new(
            1,
            Role::Write,
            MockDriver::credential("db-1"),
            Rc::new(driver.clone()),
        ))
    }

    #[test]
    fn open_and_close_cycle() {
        let driver = MockDriver::new();
        let pipe = pipe(&driver);
        assert_eq!(pipe.state(), PipeState::Closed);
        assert!(pipe.open());
        assert_eq!(pipe.state(), PipeState::Idle);
        assert!(pipe.open());
        assert_eq!(driver.stats().connects, 1);
        assert_eq!(driver.stats().charsets, vec!["utf8mb4 utf8mb4_unicode_ci".to_string()]);

        pipe.close();
        assert_eq!(pipe.state(), PipeState::Closed);
        assert_eq!(driver.stats().kills, 1);
        pipe.close();
        assert_eq!(driver.stats().kills, 1);
    }

    #[test]
    fn failed_open_stays_closed() {
        let driver = MockDriver::new();
        driver.fail_next_connects(1);
        let pipe = pipe(&driver);
        assert!(!pipe.open());
        assert_eq!(pipe.state(), PipeState::Closed);
        assert!(pipe.open());
    }

    #[test]
    fn ping_requires_open_link() {
        let driver = MockDriver::new();
        let pipe = pipe(&driver);
        assert!(!pipe.ping());
        pipe.open();
        assert!(pipe.ping());
        driver.set_ping_ok(false);
        assert!(!pipe.ping());
    }

    #[tokio::test(start_paused = true)]
    async fn query_settles_and_returns_to_idle() {
        run_local(async {
            let driver = MockDriver::new();
            let pipe = pipe(&driver);
            pipe.open();
            let pending = pipe
                .query("insert into users (name) values (?)", &[RowValues::Text("wang'wu".into())])
                .unwrap();
            assert_eq!(pipe.state(), PipeState::Working);
            assert!(pipe.query("select 1", &[]).is_err());

            pipe.reap();
            let result = pending.await.unwrap();
            assert_eq!(result.affected_rows(), 1);
            assert_eq!(pipe.state(), PipeState::Idle);
            assert_eq!(
                driver.stats().statements.last().map(String::as_str),
                Some("insert into users (name) values ('wang\\'wu')")
            );
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_rejects_pending_statement() {
        run_local(async {
            let driver = MockDriver::new();
            driver.reply_with(|_| MockReply::rows(vec!["1"], vec![vec![RowValues::Int(1)]]));
            let pipe = pipe(&driver);
            pipe.open();
            let pending = pipe.query("select 1", &[]).unwrap();
            pipe.close();
            let err = pending.await.unwrap_err();
            assert!(matches!(err, SqlPipesError::Pipe(ref msg) if msg.contains("forced to close")));
            assert_eq!(pipe.state(), PipeState::Closed);
        })
        .await;
    }

    #[test]
    fn binding_mismatch_leaves_pipe_idle() {
        let driver = MockDriver::new();
        let pipe = pipe(&driver);
        pipe.open();
        let err = pipe.query("select ?", &[]).map(|_| ()).err();
        // no bindings: sent verbatim
        assert!(err.is_none());
        pipe.reap();
        let err = pipe
            .query("select ?, ?", &[RowValues::Int(1)])
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, SqlPipesError::InvalidArgument(_)));
        assert_eq!(pipe.state(), PipeState::Idle);
    }
}
