use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::PipesConfig;
use crate::driver::Driver;
use crate::error::SqlPipesError;
use crate::pool::PipeManager;
use crate::query::{QueryManager, QueryOption};
use crate::results::{QueryResult, ResultSet, Row, Rows};
use crate::transaction::{self, Transaction};
use crate::types::RowValues;

type BeforeExecuting = Rc<dyn Fn(&str, &[RowValues])>;

/// One recorded statement.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryLogEntry {
    pub sql: String,
    pub bindings: Vec<RowValues>,
    /// Time from submission until the statement settled.
    pub elapsed: Duration,
}

struct Shared {
    database: String,
    default_timeout: Duration,
    logging: Cell<bool>,
    log: RefCell<Vec<QueryLogEntry>>,
    before_executing: RefCell<Vec<BeforeExecuting>>,
}

impl Shared {
    fn record(&self, sql: String, bindings: Vec<RowValues>, elapsed: Duration) {
        if self.logging.get() {
            self.log.borrow_mut().push(QueryLogEntry {
                sql,
                bindings,
                elapsed,
            });
        }
    }
}

/// Caller-facing handle: typed statement helpers, transactions, the query log and teardown.
///
/// Every method that runs a statement requests its pipe immediately and returns a `'static`
/// future, so several statements can be started before any is awaited. All of them must run
/// inside a [`tokio::task::LocalSet`]. Errors come back wrapped in [`SqlPipesError::Query`];
/// use [`SqlPipesError::cause`] for the underlying one.
///
/// ```rust
/// use std::rc::Rc;
/// use sql_pipes::prelude::*;
/// use sql_pipes::test_utils::{MockDriver, run_local};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), SqlPipesError> {
/// run_local(async {
///     let config = PipesConfig::builder("127.0.0.1").login("app", "secret").finish();
///     let conn = Connection::new(config, Rc::new(MockDriver::new()))?;
///
///     let id = conn
///         .insert_get_id("insert into users (name) values (?)", &["alice".into()], None)
///         .await?;
///     let rows = conn.select("select 1", &[], None).await?;
///     assert_eq!(id, 1);
///     assert_eq!(rows.len(), 1);
///
///     conn.disconnect();
///     Ok::<(), SqlPipesError>(())
/// })
/// .await
/// # }
/// ```
#[derive(Clone)]
pub struct Connection {
    qm: QueryManager,
    shared: Rc<Shared>,
}

impl Connection {
    /// # Errors
    /// Returns [`SqlPipesError::Config`] when `config` fails validation.
    pub fn new(config: PipesConfig, driver: Rc<dyn Driver>) -> Result<Self, SqlPipesError> {
        let qm = QueryManager::new(&config, driver)?;
        Ok(Self {
            qm,
            shared: Rc::new(Shared {
                database: config.database,
                default_timeout: config.max_running_seconds,
                logging: Cell::new(false),
                log: RefCell::new(Vec::new()),
                before_executing: RefCell::new(Vec::new()),
            }),
        })
    }

    #[must_use]
    pub fn database_name(&self) -> &str {
        &self.shared.database
    }

    #[must_use]
    pub fn query_manager(&self) -> &QueryManager {
        &self.qm
    }

    #[must_use]
    pub fn pipe_manager(&self) -> &PipeManager {
        self.qm.pipe_manager()
    }

    /// Options used when a call passes none: the configured default timeout.
    #[must_use]
    pub fn default_option(&self) -> QueryOption {
        QueryOption::new().with_timeout(self.shared.default_timeout)
    }

    /// Register a callback invoked with every statement before it is submitted.
    pub fn before_executing<F>(&self, callback: F)
    where
        F: Fn(&str, &[RowValues]) + 'static,
    {
        self.shared
            .before_executing
            .borrow_mut()
            .push(Rc::new(callback));
    }

    /// Run a statement and hand back its raw outcome.
    pub fn execute(
        &self,
        sql: &str,
        bindings: &[RowValues],
        option: Option<QueryOption>,
    ) -> impl Future<Output = Result<QueryResult, SqlPipesError>> + use<> {
        self.run(sql, bindings, option, Ok)
    }

    /// Run a statement for its side effect.
    pub fn statement(
        &self,
        sql: &str,
        bindings: &[RowValues],
        option: Option<QueryOption>,
    ) -> impl Future<Output = Result<bool, SqlPipesError>> + use<> {
        self.run(sql, bindings, option, |_| Ok(true))
    }

    /// Run a statement without bindings; `?` is sent as is.
    pub fn unprepared(
        &self,
        sql: &str,
        option: Option<QueryOption>,
    ) -> impl Future<Output = Result<bool, SqlPipesError>> + use<> {
        self.statement(sql, &[], option)
    }

    pub fn insert(
        &self,
        sql: &str,
        bindings: &[RowValues],
        option: Option<QueryOption>,
    ) -> impl Future<Output = Result<bool, SqlPipesError>> + use<> {
        self.statement(sql, bindings, option)
    }

    /// Run an insert and return the generated id.
    pub fn insert_get_id(
        &self,
        sql: &str,
        bindings: &[RowValues],
        option: Option<QueryOption>,
    ) -> impl Future<Output = Result<u64, SqlPipesError>> + use<> {
        self.run(sql, bindings, option, |result| Ok(result.last_insert_id()))
    }

    /// Run a statement and return the number of affected rows.
    pub fn affecting_statement(
        &self,
        sql: &str,
        bindings: &[RowValues],
        option: Option<QueryOption>,
    ) -> impl Future<Output = Result<u64, SqlPipesError>> + use<> {
        self.run(sql, bindings, option, |result| Ok(result.affected_rows()))
    }

    pub fn update(
        &self,
        sql: &str,
        bindings: &[RowValues],
        option: Option<QueryOption>,
    ) -> impl Future<Output = Result<u64, SqlPipesError>> + use<> {
        self.affecting_statement(sql, bindings, option)
    }

    pub fn delete(
        &self,
        sql: &str,
        bindings: &[RowValues],
        option: Option<QueryOption>,
    ) -> impl Future<Output = Result<u64, SqlPipesError>> + use<> {
        self.affecting_statement(sql, bindings, option)
    }

    /// Run a query and collect every row.
    pub fn select(
        &self,
        sql: &str,
        bindings: &[RowValues],
        option: Option<QueryOption>,
    ) -> impl Future<Output = Result<ResultSet, SqlPipesError>> + use<> {
        self.run(sql, bindings, option, |mut result| result.fetch_all())
    }

    /// Run a query and return its first row, if any.
    pub fn select_one(
        &self,
        sql: &str,
        bindings: &[RowValues],
        option: Option<QueryOption>,
    ) -> impl Future<Output = Result<Option<Row>, SqlPipesError>> + use<> {
        self.run(sql, bindings, option, |mut result| result.fetch_one())
    }

    /// Run a query and iterate its rows lazily.
    pub fn cursor(
        &self,
        sql: &str,
        bindings: &[RowValues],
        option: Option<QueryOption>,
    ) -> impl Future<Output = Result<Rows, SqlPipesError>> + use<> {
        self.run(sql, bindings, option, |mut result| result.rows())
    }

    /// Start a transaction on a write pipe and pin that pipe to it.
    ///
    /// Without commit or rollback within `deadline` (180 seconds when `None`) the pipe is
    /// force-closed and the transaction ends.
    pub fn begin_transaction(
        &self,
        deadline: Option<Duration>,
    ) -> impl Future<Output = Result<Transaction, SqlPipesError>> + use<> {
        let deadline = deadline.unwrap_or(transaction::DEFAULT_DEADLINE);
        let started = self.execute(
            transaction::START_TRANSACTION,
            &[],
            Some(self.default_option().with_force_write(true)),
        );
        async move {
            let result = started.await?;
            // the statement's lease is released only as its future completes, so nothing
            // else can have taken the pipe yet
            Ok::<_, SqlPipesError>(Transaction::begin(result.pipe(), deadline))
        }
    }

    /// # Errors
    /// [`SqlPipesError::TransactionState`] (wrapped) without touching the server when the
    /// transaction is closed. Any other failure closes the transaction and its pipe.
    pub fn commit(
        &self,
        transaction: &Transaction,
    ) -> impl Future<Output = Result<bool, SqlPipesError>> + use<> {
        self.finish_transaction(transaction, transaction::COMMIT)
    }

    /// # Errors
    /// Same as [`Connection::commit`].
    pub fn rollback(
        &self,
        transaction: &Transaction,
    ) -> impl Future<Output = Result<bool, SqlPipesError>> + use<> {
        self.finish_transaction(transaction, transaction::ROLLBACK)
    }

    /// Abandon `transaction` and close its pipe.
    pub fn close_transaction(&self, transaction: &Transaction) {
        transaction.close();
    }

    fn finish_transaction(
        &self,
        transaction: &Transaction,
        sql: &'static str,
    ) -> impl Future<Output = Result<bool, SqlPipesError>> + use<> {
        let started = transaction.is_active().then(|| {
            self.execute(sql, &[], Some(self.default_option().with_transaction(transaction)))
        });
        let transaction = transaction.clone();
        async move {
            let Some(started) = started else {
                return Err(SqlPipesError::TransactionState("transaction is closed".into())
                    .in_query(sql, &[]));
            };
            match started.await {
                Ok(_) => {
                    transaction.finish();
                    Ok(true)
                }
                Err(err) => {
                    tracing::error!("error while transaction {sql}: {err}");
                    transaction.close();
                    Err(err)
                }
            }
        }
    }

    pub fn enable_query_log(&self) {
        self.shared.logging.set(true);
    }

    pub fn disable_query_log(&self) {
        self.shared.logging.set(false);
    }

    #[must_use]
    pub fn logging(&self) -> bool {
        self.shared.logging.get()
    }

    #[must_use]
    pub fn query_log(&self) -> Vec<QueryLogEntry> {
        self.shared.log.borrow().clone()
    }

    pub fn flush_query_log(&self) {
        self.shared.log.borrow_mut().clear();
    }

    /// See [`PipeManager::set_recycle_debounce`].
    pub fn set_recycle_debounce(&self, window: Duration) -> &Self {
        self.pipe_manager().set_recycle_debounce(window);
        self
    }

    /// See [`PipeManager::set_ping_debounce`].
    pub fn set_ping_debounce(&self, window: Duration) -> &Self {
        self.pipe_manager().set_ping_debounce(window);
        self
    }

    /// Close every pipe and fail everything queued or running.
    pub fn disconnect(&self) {
        self.qm.close();
        tracing::debug!(database = %self.shared.database, "connection disconnected");
    }

    fn run<T, F>(
        &self,
        sql: &str,
        bindings: &[RowValues],
        option: Option<QueryOption>,
        then: F,
    ) -> impl Future<Output = Result<T, SqlPipesError>> + use<T, F>
    where
        F: FnOnce(QueryResult) -> Result<T, SqlPipesError> + 'static,
        T: 'static,
    {
        let hooks = self.shared.before_executing.borrow().clone();
        for hook in hooks {
            hook(sql, bindings);
        }

        let option = option.unwrap_or_else(|| self.default_option());
        let submitted = Instant::now();
        let pending = self.qm.execute(sql, bindings, &option);
        let shared = Rc::clone(&self.shared);
        let sql = sql.to_string();
        let bindings = bindings.to_vec();
        async move {
            let outcome = pending.await.and_then(then);
            let outcome = outcome.map_err(|err| err.in_query(&sql, &bindings));
            shared.record(sql, bindings, submitted.elapsed());
            outcome
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("database", &self.shared.database)
            .field("default_timeout", &self.shared.default_timeout)
            .field("logging", &self.shared.logging.get())
            .field("qm", &self.qm)
            .finish()
    }
}
