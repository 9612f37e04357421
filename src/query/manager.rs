use std::rc::Rc;
use std::sync::LazyLock;

use regex::Regex;
use tokio::time::Instant;

use super::option::QueryOption;
use super::pending::PendingQuery;
use super::poll::PollSet;
use crate::config::PipesConfig;
use crate::driver::Driver;
use crate::error::SqlPipesError;
use crate::pipe::{PipeLease, PipeState};
use crate::pool::PipeManager;
use crate::types::{RowValues, Role};

static READ_STATEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(SELECT|SHOW|DESCRIBE)\b").expect("read statement pattern is valid")
});

/// Role a statement runs under when nothing forces the write pool.
#[must_use]
pub fn infer_role(sql: &str) -> Role {
    if READ_STATEMENT.is_match(sql) {
        Role::Read
    } else {
        Role::Write
    }
}

/// Routes statements to a pool, starts them, and settles them from the poll-set.
#[derive(Clone)]
pub struct QueryManager {
    pm: PipeManager,
    polls: Rc<PollSet>,
}

impl QueryManager {
    /// # Errors
    /// Returns [`SqlPipesError::Config`] when `config` fails validation.
    pub fn new(config: &PipesConfig, driver: Rc<dyn Driver>) -> Result<Self, SqlPipesError> {
        let pm = PipeManager::new(config, Rc::clone(&driver))?;
        Ok(Self {
            pm,
            polls: PollSet::new(driver),
        })
    }

    #[must_use]
    pub fn pipe_manager(&self) -> &PipeManager {
        &self.pm
    }

    /// Run `sql` with `bindings`.
    ///
    /// The pipe is requested immediately, so a full waiting list is decided here; the returned
    /// future reports it. Statements pinned to a transaction or forced to write go to the write
    /// pool, `SELECT`/`SHOW`/`DESCRIBE` go to the read pool, everything else to the write pool.
    pub fn execute(&self, sql: &str, bindings: &[RowValues], option: &QueryOption) -> PendingQuery {
        let role = if option.transaction.is_some() || option.force_write {
            Role::Write
        } else {
            infer_role(sql)
        };
        tracing::debug!(%role, sql, "fetching pipe for query");
        let acquire = match &option.transaction {
            Some(transaction) => self.pm.get_by_transaction(transaction),
            None => self.pm.get(role),
        };

        let mut guard = InFlight {
            pm: self.pm.clone(),
            polls: Rc::clone(&self.polls),
            role,
            lease: None,
            running: false,
        };
        let sql = sql.to_string();
        let bindings = bindings.to_vec();
        let run = async move {
            let lease = acquire.await?;
            tracing::debug!(pipe = lease.pipe().id(), sql = %sql, "got a pipe for query");
            let query = lease.query(&sql, &bindings)?;
            guard.polls.register(Rc::clone(lease.pipe()));
            guard.lease = Some(lease);
            guard.running = true;
            let settled = query.await;
            guard.running = false;
            if let Some(lease) = &guard.lease {
                tracing::debug!(pipe = lease.pipe().id(), sql = %sql, "query result is settled");
            }
            settled
        };

        let timeout = option.timeout;
        // a deadline past the clock's range is no deadline
        let Some(deadline) = Instant::now()
            .checked_add(timeout)
            .filter(|_| !timeout.is_zero())
        else {
            return PendingQuery::new(Box::pin(run));
        };
        PendingQuery::new(Box::pin(async move {
            tokio::time::timeout_at(deadline, run)
                .await
                .unwrap_or(Err(SqlPipesError::Timeout(timeout)))
        }))
    }

    /// Number of statements awaiting completion.
    #[must_use]
    pub fn running(&self) -> usize {
        self.polls.len()
    }

    /// Stop polling and close the pipe manager. Statements in flight fail with a forced-close
    /// error.
    pub fn close(&self) {
        self.polls.clear();
        self.pm.close();
    }
}

impl std::fmt::Debug for QueryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryManager")
            .field("pm", &self.pm)
            .field("running", &self.polls.len())
            .finish()
    }
}

/// Everything one execution holds. Dropping it before the statement settles (cancellation or
/// timeout) force-closes the pipe, since a running statement cannot be stopped any other way.
struct InFlight {
    pm: PipeManager,
    polls: Rc<PollSet>,
    role: Role,
    lease: Option<PipeLease>,
    running: bool,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.running {
            if let Some(lease) = &self.lease {
                let pipe = lease.pipe();
                self.polls.remove(pipe.id());
                if pipe.in_state(PipeState::Working) {
                    tracing::debug!(pipe = pipe.id(), "closing pipe of an abandoned query");
                    pipe.close();
                }
            }
        }
        // release before scheduling so the recycle sees the pipe free
        self.lease.take();
        self.pm.debounce_recycle(self.role);
    }
}
