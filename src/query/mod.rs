mod manager;
mod option;
mod pending;
mod poll;

pub use manager::{QueryManager, infer_role};
pub use option::QueryOption;
pub use pending::PendingQuery;
