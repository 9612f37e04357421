use std::time::Duration;

use thiserror::Error;

use crate::driver::DriverError;
use crate::types::RowValues;

#[derive(Debug, Error)]
pub enum SqlPipesError {
    #[error("waiting list is full (capacity {0})")]
    Capacity(usize),

    #[error("Pipe error: {0}")]
    Pipe(String),

    #[error("Statement error [{code}]: {message}")]
    Statement { code: u32, message: String },

    #[error("Statement timed out after {0:?}")]
    Timeout(Duration),

    #[error("Statement cancelled; connection closed due to cancelling")]
    Cancelled,

    #[error("Transaction error: {0}")]
    TransactionState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("Query failed ({sql}): {source}")]
    Query {
        sql: String,
        bindings: Vec<RowValues>,
        #[source]
        source: Box<SqlPipesError>,
    },
}

impl SqlPipesError {
    /// Wrap an error with the statement that produced it.
    #[must_use]
    pub fn in_query(self, sql: &str, bindings: &[RowValues]) -> Self {
        SqlPipesError::Query {
            sql: sql.to_string(),
            bindings: bindings.to_vec(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through any `Query` wrappers.
    #[must_use]
    pub fn cause(&self) -> &SqlPipesError {
        let mut current = self;
        while let SqlPipesError::Query { source, .. } = current {
            current = source;
        }
        current
    }

    #[must_use]
    pub fn is_capacity(&self) -> bool {
        matches!(self.cause(), SqlPipesError::Capacity(_))
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.cause(), SqlPipesError::Cancelled)
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self.cause(), SqlPipesError::Timeout(_))
    }

    #[must_use]
    pub fn is_transaction_state(&self) -> bool {
        matches!(self.cause(), SqlPipesError::TransactionState(_))
    }
}

impl From<serde_json::Error> for SqlPipesError {
    fn from(err: serde_json::Error) -> Self {
        SqlPipesError::Config(format!("invalid JSON configuration: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cause_looks_through_query_wrappers() {
        let err = SqlPipesError::Capacity(5)
            .in_query("select 1", &[])
            .in_query("outer", &[RowValues::Int(1)]);
        assert!(err.is_capacity());
        assert!(matches!(err.cause(), SqlPipesError::Capacity(5)));
        assert!(err.to_string().contains("outer"));
    }
}
