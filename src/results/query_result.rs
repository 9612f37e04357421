use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use super::result_set::ResultSet;
use super::row::{Row, index_columns};
use crate::driver::RowSource;
use crate::error::SqlPipesError;
use crate::pipe::Pipe;

enum RowHandle {
    Absent,
    Open(Box<dyn RowSource>),
    Consumed,
}

/// Outcome of one statement.
///
/// Statements that return rows carry a single-use row handle: `fetch_one`, `fetch_all` and
/// `rows` each take it, release it when done, and fail with [`SqlPipesError::Usage`] if it has
/// already been taken.
pub struct QueryResult {
    pipe: Rc<Pipe>,
    rows: RowHandle,
    last_insert_id: u64,
    affected_rows: u64,
}

impl QueryResult {
    pub(crate) fn with_rows(pipe: Rc<Pipe>, source: Box<dyn RowSource>) -> Self {
        Self {
            pipe,
            rows: RowHandle::Open(source),
            last_insert_id: 0,
            affected_rows: 0,
        }
    }

    pub(crate) fn with_execution(pipe: Rc<Pipe>, last_insert_id: u64, affected_rows: u64) -> Self {
        Self {
            pipe,
            rows: RowHandle::Absent,
            last_insert_id,
            affected_rows,
        }
    }

    /// The pipe the statement ran on. Used to pin transactions.
    #[must_use]
    pub fn pipe(&self) -> &Rc<Pipe> {
        &self.pipe
    }

    #[must_use]
    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    #[must_use]
    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    /// Whether an unconsumed row handle is still attached.
    #[must_use]
    pub fn has_rows(&self) -> bool {
        matches!(self.rows, RowHandle::Open(_))
    }

    /// First row, releasing the handle afterwards.
    ///
    /// # Errors
    /// Fails with [`SqlPipesError::Usage`] if the rows were already consumed or the statement
    /// returned none, or with the driver's error if the fetch fails.
    pub fn fetch_one(&mut self) -> Result<Option<Row>, SqlPipesError> {
        let mut source = self.take_source()?;
        let names = source.columns();
        let fetched = source.next_row();
        source.close();
        Ok(fetched?.map(|values| Row::new(names, values)))
    }

    /// All rows, releasing the handle afterwards.
    ///
    /// # Errors
    /// Same as [`QueryResult::fetch_one`].
    pub fn fetch_all(&mut self) -> Result<ResultSet, SqlPipesError> {
        let mut source = self.take_source()?;
        let mut set = ResultSet::new(source.columns());
        let outcome = loop {
            match source.next_row() {
                Ok(Some(values)) => set.add_row_values(values),
                Ok(None) => break Ok(set),
                Err(err) => break Err(err.into()),
            }
        };
        source.close();
        outcome
    }

    /// Lazy iterator over the rows. The handle is released when the iterator is exhausted,
    /// hits an error, or is dropped.
    ///
    /// # Errors
    /// Same as [`QueryResult::fetch_one`].
    pub fn rows(&mut self) -> Result<Rows, SqlPipesError> {
        let source = self.take_source()?;
        Ok(Rows::new(source))
    }

    fn take_source(&mut self) -> Result<Box<dyn RowSource>, SqlPipesError> {
        match std::mem::replace(&mut self.rows, RowHandle::Consumed) {
            RowHandle::Open(source) => Ok(source),
            RowHandle::Consumed => Err(SqlPipesError::Usage(
                "result rows were already consumed".into(),
            )),
            RowHandle::Absent => {
                self.rows = RowHandle::Absent;
                Err(SqlPipesError::Usage(
                    "statement did not produce a result set".into(),
                ))
            }
        }
    }
}

impl Drop for QueryResult {
    fn drop(&mut self) {
        if let RowHandle::Open(source) = &mut self.rows {
            source.close();
        }
    }
}

impl fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryResult")
            .field("pipe", &self.pipe.id())
            .field("has_rows", &self.has_rows())
            .field("last_insert_id", &self.last_insert_id)
            .field("affected_rows", &self.affected_rows)
            .finish()
    }
}

/// Lazy row sequence taken from a [`QueryResult`].
pub struct Rows {
    source: Option<Box<dyn RowSource>>,
    column_names: Arc<Vec<String>>,
    column_index: Arc<HashMap<String, usize>>,
}

impl Rows {
    fn new(source: Box<dyn RowSource>) -> Self {
        let column_names = source.columns();
        let column_index = Arc::new(index_columns(&column_names));
        Self {
            source: Some(source),
            column_names,
            column_index,
        }
    }

    fn release(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.close();
        }
    }
}

impl Iterator for Rows {
    type Item = Result<Row, SqlPipesError>;

    fn next(&mut self) -> Option<Self::Item> {
        let fetched = self.source.as_mut()?.next_row();
        match fetched {
            Ok(Some(values)) => Some(Ok(Row::with_index(
                Arc::clone(&self.column_names),
                Arc::clone(&self.column_index),
                values,
            ))),
            Ok(None) => {
                self.release();
                None
            }
            Err(err) => {
                self.release();
                Some(Err(err.into()))
            }
        }
    }
}

impl Drop for Rows {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Rows {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rows")
            .field("columns", &self.column_names)
            .field("open", &self.source.is_some())
            .finish()
    }
}
