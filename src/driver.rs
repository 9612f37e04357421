//! The non-blocking wire primitive the pool is built on.
//!
//! A [`Driver`] opens [`Link`]s; a link runs at most one statement at a time and is driven
//! issue-then-poll: [`Link::start`] sends the statement without waiting, [`Driver::poll_ready`]
//! reports which links have something to reap, and [`Link::reap`] fetches the outcome.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::types::RowValues;

/// Failure reported by the driver or the server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{code}] {message}")]
pub struct DriverError {
    pub code: u32,
    pub message: String,
}

impl DriverError {
    #[must_use]
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Everything needed to open one physical link.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub charset: String,
    pub collation: String,
}

// Manual Debug implementation so passwords never reach the logs
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("charset", &self.charset)
            .field("collation", &self.collation)
            .finish()
    }
}

/// Readiness of a single link, as seen by one non-blocking check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Still running.
    Pending,
    /// An outcome can be reaped.
    Ready,
    /// The link reported an error condition.
    Errored,
    /// The link refused the check (for example it is no longer connected).
    Rejected,
}

/// Result of one readiness check across many links. Indices refer to the slice passed to
/// [`Driver::poll_ready`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub ready: Vec<usize>,
    pub errored: Vec<usize>,
    pub rejected: Vec<usize>,
}

impl PollOutcome {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.errored.is_empty() && self.rejected.is_empty()
    }
}

/// Row handle produced by a statement that returns a result set.
pub trait RowSource {
    /// Column names shared by every row of this result.
    fn columns(&self) -> Arc<Vec<String>>;

    /// Next row, or `None` once the result is exhausted.
    ///
    /// # Errors
    /// Returns [`DriverError`] when the row cannot be fetched.
    fn next_row(&mut self) -> Result<Option<Vec<RowValues>>, DriverError>;

    /// Release the underlying result. Called exactly once by the consumer.
    fn close(&mut self) {}
}

/// Outcome of a reaped statement.
pub enum Outcome {
    Rows(Box<dyn RowSource>),
    Affected { insert_id: u64, affected_rows: u64 },
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Rows(_) => f.debug_tuple("Rows").field(&"<RowSource>").finish(),
            Outcome::Affected {
                insert_id,
                affected_rows,
            } => f
                .debug_struct("Affected")
                .field("insert_id", insert_id)
                .field("affected_rows", affected_rows)
                .finish(),
        }
    }
}

/// One open physical connection.
pub trait Link {
    /// Server-side id of this link, used only for logging.
    fn thread_id(&self) -> u64;

    /// Apply `SET NAMES <charset> COLLATE <collation>`.
    ///
    /// # Errors
    /// Returns [`DriverError`] when the server refuses the charset.
    fn set_charset(&mut self, charset: &str, collation: &str) -> Result<(), DriverError>;

    /// Start a statement without waiting for it.
    ///
    /// # Errors
    /// Returns [`DriverError`] when the statement could not be sent.
    fn start(&mut self, sql: &str) -> Result<(), DriverError>;

    /// Non-blocking readiness check for the statement in flight.
    fn readiness(&mut self) -> Readiness;

    /// Fetch the outcome of the finished statement.
    ///
    /// # Errors
    /// Returns the server's error for a failed statement.
    fn reap(&mut self) -> Result<Outcome, DriverError>;

    /// Last error recorded on this link.
    fn last_error(&self) -> DriverError;

    /// Liveness probe.
    fn ping(&mut self) -> bool;

    /// Abort whatever is running and close the link. Best effort.
    fn kill(&mut self);

    /// Escape a string for use inside a single-quoted literal.
    fn escape(&self, value: &str) -> String {
        escape_string(value)
    }
}

/// Opens links and checks readiness across them.
pub trait Driver {
    /// Open a link with the given credential.
    ///
    /// # Errors
    /// Returns [`DriverError`] when the server cannot be reached or refuses the login.
    fn connect(&self, credential: &Credential) -> Result<Box<dyn Link>, DriverError>;

    /// One non-blocking readiness check across `links`.
    ///
    /// The default asks each link in turn; drivers with a native multi-link poll override it.
    fn poll_ready(&self, links: &mut [&mut dyn Link]) -> PollOutcome {
        let mut outcome = PollOutcome::default();
        for (idx, link) in links.iter_mut().enumerate() {
            match link.readiness() {
                Readiness::Pending => {}
                Readiness::Ready => outcome.ready.push(idx),
                Readiness::Errored => outcome.errored.push(idx),
                Readiness::Rejected => outcome.rejected.push(idx),
            }
        }
        outcome
    }
}

/// MySQL string escaping, as applied by `mysql_real_escape_string` for the utf8 charsets.
#[must_use]
pub fn escape_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    for ch in value.chars() {
        match ch {
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\x1a' => out.push_str("\\Z"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_quotes_and_control_bytes() {
        assert_eq!(escape_string("wang'wu"), "wang\\'wu");
        assert_eq!(escape_string("a\\b\n\"c\""), "a\\\\b\\n\\\"c\\\"");
        assert_eq!(escape_string("plain"), "plain");
    }

    #[test]
    fn credential_debug_hides_password() {
        let credential = Credential {
            host: "db".into(),
            port: 3306,
            username: "app".into(),
            password: "hunter2".into(),
            database: "main".into(),
            charset: "utf8mb4".into(),
            collation: "utf8mb4_unicode_ci".into(),
        };
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
