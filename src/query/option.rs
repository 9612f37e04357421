use std::time::Duration;

use crate::transaction::Transaction;

/// Per-call options for statement execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOption {
    /// Limit on waiting plus execution. Zero means unlimited.
    pub timeout: Duration,
    /// Run on the pipe pinned to this transaction.
    pub transaction: Option<Transaction>,
    /// Route to the write pool regardless of the statement.
    pub force_write: bool,
}

impl QueryOption {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_transaction(mut self, transaction: &Transaction) -> Self {
        self.transaction = Some(transaction.clone());
        self
    }

    #[must_use]
    pub fn with_force_write(mut self, force_write: bool) -> Self {
        self.force_write = force_write;
        self
    }
}
