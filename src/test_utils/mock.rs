use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;

use crate::driver::{Credential, Driver, DriverError, Link, Outcome, Readiness, RowSource};
use crate::types::RowValues;

static SLEEP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*SELECT\s+SLEEP\((\d+(?:\.\d+)?)\)").expect("sleep pattern is valid")
});

/// Scripted outcome of one statement.
#[derive(Debug, Clone)]
pub struct MockReply {
    outcome: MockOutcome,
    delay: Duration,
}

#[derive(Debug, Clone)]
enum MockOutcome {
    Rows {
        columns: Arc<Vec<String>>,
        rows: Vec<Vec<RowValues>>,
    },
    Affected {
        insert_id: u64,
        affected_rows: u64,
    },
    Error(DriverError),
}

impl MockReply {
    #[must_use]
    pub fn rows(columns: Vec<&str>, rows: Vec<Vec<RowValues>>) -> Self {
        Self {
            outcome: MockOutcome::Rows {
                columns: Arc::new(columns.into_iter().map(str::to_string).collect()),
                rows,
            },
            delay: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn affected(insert_id: u64, affected_rows: u64) -> Self {
        Self {
            outcome: MockOutcome::Affected {
                insert_id,
                affected_rows,
            },
            delay: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn error(code: u32, message: &str) -> Self {
        Self {
            outcome: MockOutcome::Error(DriverError::new(code, message)),
            delay: Duration::ZERO,
        }
    }

    /// Report the outcome only after `delay` has passed.
    #[must_use]
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Counters recorded by a [`MockDriver`] across all of its links.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockStats {
    pub connects: usize,
    pub kills: usize,
    pub pings: usize,
    pub closed_results: usize,
    /// Every statement sent, after binding.
    pub statements: Vec<String>,
    /// `"<charset> <collation>"` per successful charset change.
    pub charsets: Vec<String>,
}

type Handler = Rc<dyn Fn(&str) -> MockReply>;

struct MockState {
    handler: Option<Handler>,
    fail_connects: usize,
    fail_charsets: usize,
    fail_starts: usize,
    ping_ok: bool,
    next_thread_id: u64,
    next_insert_id: u64,
    stats: MockStats,
}

/// In-memory [`Driver`] with scripted replies and shared counters.
///
/// Without a handler, `SELECT SLEEP(n)` takes n seconds, other reads return one row, inserts
/// return an increasing insert id, and every other statement affects one row.
#[derive(Clone)]
pub struct MockDriver {
    state: Rc<RefCell<MockState>>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(MockState {
                handler: None,
                fail_connects: 0,
                fail_charsets: 0,
                fail_starts: 0,
                ping_ok: true,
                next_thread_id: 0,
                next_insert_id: 0,
                stats: MockStats::default(),
            })),
        }
    }

    #[must_use]
    pub fn credential(host: &str) -> Credential {
        Credential {
            host: host.to_string(),
            port: 3306,
            username: "test".into(),
            password: "test".into(),
            database: "test".into(),
            charset: "utf8mb4".into(),
            collation: "utf8mb4_unicode_ci".into(),
        }
    }

    /// Script every statement's reply.
    pub fn reply_with<F>(&self, handler: F)
    where
        F: Fn(&str) -> MockReply + 'static,
    {
        self.state.borrow_mut().handler = Some(Rc::new(handler));
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.state.borrow_mut().fail_connects = count;
    }

    pub fn fail_next_charsets(&self, count: usize) {
        self.state.borrow_mut().fail_charsets = count;
    }

    pub fn fail_next_starts(&self, count: usize) {
        self.state.borrow_mut().fail_starts = count;
    }

    /// Whether pings on live links succeed.
    pub fn set_ping_ok(&self, ok: bool) {
        self.state.borrow_mut().ping_ok = ok;
    }

    #[must_use]
    pub fn stats(&self) -> MockStats {
        self.state.borrow().stats.clone()
    }

    fn reply_for(&self, sql: &str) -> MockReply {
        let handler = self.state.borrow().handler.clone();
        if let Some(handler) = handler {
            return handler(sql);
        }

        if let Some(secs) = SLEEP
            .captures(sql)
            .and_then(|caps| caps.get(1))
            .and_then(|secs| secs.as_str().parse::<f64>().ok())
        {
            return MockReply::rows(vec!["SLEEP"], vec![vec![RowValues::Int(0)]])
                .after(Duration::from_secs_f64(secs));
        }
        let head = sql.trim_start().to_ascii_uppercase();
        if ["START TRANSACTION", "COMMIT", "ROLLBACK"]
            .iter()
            .any(|stmt| head.starts_with(stmt))
        {
            MockReply::affected(0, 0)
        } else if crate::query::infer_role(sql) == crate::types::Role::Read {
            MockReply::rows(vec!["1"], vec![vec![RowValues::Int(1)]])
        } else if head.starts_with("INSERT") {
            let mut state = self.state.borrow_mut();
            state.next_insert_id += 1;
            MockReply::affected(state.next_insert_id, 1)
        } else {
            MockReply::affected(0, 1)
        }
    }
}

impl fmt::Debug for MockDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockDriver")
            .field("stats", &self.state.borrow().stats)
            .finish()
    }
}

impl Driver for MockDriver {
    fn connect(&self, credential: &Credential) -> Result<Box<dyn Link>, DriverError> {
        let mut state = self.state.borrow_mut();
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(DriverError::new(
                2002,
                format!("Can't connect to MySQL server on '{}'", credential.host),
            ));
        }
        state.stats.connects += 1;
        state.next_thread_id += 1;
        Ok(Box::new(MockLink {
            driver: self.clone(),
            thread_id: state.next_thread_id,
            alive: true,
            inflight: None,
            last_error: DriverError::new(0, ""),
        }))
    }
}

struct MockLink {
    driver: MockDriver,
    thread_id: u64,
    alive: bool,
    inflight: Option<(MockOutcome, Instant)>,
    last_error: DriverError,
}

impl Link for MockLink {
    fn thread_id(&self) -> u64 {
        self.thread_id
    }

    fn set_charset(&mut self, charset: &str, collation: &str) -> Result<(), DriverError> {
        let mut state = self.driver.state.borrow_mut();
        if state.fail_charsets > 0 {
            state.fail_charsets -= 1;
            return Err(DriverError::new(1115, format!("Unknown character set: '{charset}'")));
        }
        state.stats.charsets.push(format!("{charset} {collation}"));
        Ok(())
    }

    fn start(&mut self, sql: &str) -> Result<(), DriverError> {
        {
            let mut state = self.driver.state.borrow_mut();
            if !self.alive || state.fail_starts > 0 {
                state.fail_starts = state.fail_starts.saturating_sub(1);
                self.last_error = DriverError::new(2006, "MySQL server has gone away");
                return Err(self.last_error.clone());
            }
            state.stats.statements.push(sql.to_string());
        }
        let reply = self.driver.reply_for(sql);
        self.inflight = Some((reply.outcome, Instant::now() + reply.delay));
        Ok(())
    }

    fn readiness(&mut self) -> Readiness {
        match &self.inflight {
            _ if !self.alive => Readiness::Rejected,
            None => Readiness::Rejected,
            Some((_, ready_at)) if Instant::now() >= *ready_at => Readiness::Ready,
            Some(_) => Readiness::Pending,
        }
    }

    fn reap(&mut self) -> Result<Outcome, DriverError> {
        match self.inflight.take() {
            None => Err(DriverError::new(2014, "Commands out of sync")),
            Some((MockOutcome::Error(err), _)) => {
                self.last_error = err.clone();
                Err(err)
            }
            Some((MockOutcome::Affected { insert_id, affected_rows }, _)) => Ok(Outcome::Affected {
                insert_id,
                affected_rows,
            }),
            Some((MockOutcome::Rows { columns, rows }, _)) => Ok(Outcome::Rows(Box::new(MemoryRows {
                driver: self.driver.clone(),
                columns,
                rows: rows.into_iter(),
                closed: false,
            }))),
        }
    }

    fn last_error(&self) -> DriverError {
        self.last_error.clone()
    }

    fn ping(&mut self) -> bool {
        let mut state = self.driver.state.borrow_mut();
        state.stats.pings += 1;
        self.alive && state.ping_ok
    }

    fn kill(&mut self) {
        if self.alive {
            self.alive = false;
            self.inflight = None;
            self.driver.state.borrow_mut().stats.kills += 1;
        }
    }
}

struct MemoryRows {
    driver: MockDriver,
    columns: Arc<Vec<String>>,
    rows: std::vec::IntoIter<Vec<RowValues>>,
    closed: bool,
}

impl RowSource for MemoryRows {
    fn columns(&self) -> Arc<Vec<String>> {
        Arc::clone(&self.columns)
    }

    fn next_row(&mut self) -> Result<Option<Vec<RowValues>>, DriverError> {
        if self.closed {
            return Err(DriverError::new(2014, "result already freed"));
        }
        Ok(self.rows.next())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.driver.state.borrow_mut().stats.closed_results += 1;
        }
    }
}
