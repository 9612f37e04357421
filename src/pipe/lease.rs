use std::fmt;
use std::rc::Rc;

use super::{Pipe, PipeQuery};
use crate::error::SqlPipesError;
use crate::types::RowValues;

/// Checkout of a pipe, from acquisition until the holder is done with it.
///
/// While a lease is alive no other acquisition is handed the same pipe and idle recycling
/// leaves it alone. Dropping the lease returns the pipe to the pool.
pub struct PipeLease {
    pipe: Rc<Pipe>,
}

impl PipeLease {
    pub(crate) fn new(pipe: Rc<Pipe>) -> Self {
        pipe.set_leased(true);
        Self { pipe }
    }

    #[must_use]
    pub fn pipe(&self) -> &Rc<Pipe> {
        &self.pipe
    }

    /// Start a statement on the leased pipe.
    ///
    /// # Errors
    /// See [`Pipe::query`].
    pub fn query(&self, sql: &str, bindings: &[RowValues]) -> Result<PipeQuery, SqlPipesError> {
        self.pipe.query(sql, bindings)
    }
}

impl Drop for PipeLease {
    fn drop(&mut self) {
        self.pipe.set_leased(false);
    }
}

impl fmt::Debug for PipeLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeLease")
            .field("pipe", &self.pipe.id())
            .field("role", &self.pipe.role())
            .field("state", &self.pipe.state())
            .finish()
    }
}
