//! Non-blocking connection pipes for MySQL-style servers.
//!
//! A [`Connection`] keeps two pools of [`Pipe`]s (one per [`Role`]), routes every statement to
//! the right pool, queues requests on a bounded waiting list when every pipe is busy, closes
//! pipes that stay idle too long, pings the pools for health, and pins a pipe to each open
//! [`Transaction`].
//!
//! Everything is single-threaded: the engine uses `Rc`/`RefCell` internally and must run inside
//! a [`tokio::task::LocalSet`]. The wire protocol itself is supplied through the [`Driver`] and
//! [`Link`](driver::Link) traits.

pub mod binding;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod pipe;
pub mod pool;
pub mod prelude;
pub mod query;
pub mod results;
pub mod scheduler;
pub mod transaction;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{PipesConfig, PipesConfigBuilder, RoleOverrides};
pub use connection::{Connection, QueryLogEntry};
pub use driver::{Credential, Driver, DriverError};
pub use error::SqlPipesError;
pub use pipe::{Pipe, PipeLease, PipeQuery, PipeState};
pub use pool::{Acquire, PipeManager};
pub use query::{PendingQuery, QueryManager, QueryOption};
pub use results::{QueryResult, ResultSet, Row, Rows};
pub use transaction::Transaction;
pub use types::{Role, RowValues};
