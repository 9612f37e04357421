//! Convenient imports for common functionality.
//!
//! This module re-exports the most commonly used types and functions
//! to make it easier to get started with the library.

pub use crate::config::{PipesConfig, PipesConfigBuilder, RoleOverrides};
pub use crate::connection::{Connection, QueryLogEntry};
pub use crate::driver::{Credential, Driver, DriverError, Link, Outcome, Readiness, RowSource};
pub use crate::error::SqlPipesError;
pub use crate::pipe::{Pipe, PipeLease, PipeState};
pub use crate::pool::PipeManager;
pub use crate::query::{PendingQuery, QueryManager, QueryOption};
pub use crate::results::{QueryResult, ResultSet, Row, Rows};
pub use crate::transaction::Transaction;
pub use crate::types::{Role, RowValues};
