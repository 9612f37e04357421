mod query_result;
mod result_set;
mod row;

pub use query_result::{QueryResult, Rows};
pub use result_set::ResultSet;
pub use row::Row;
