use super::{DbError, SqlValue};
use std::collections::VecDeque;

/// Prepared statement state shared by the backends: bound parameters and the
/// buffered result rows. The query runs on the first `step`, later steps only
/// advance through the buffer.
#[derive(Debug)]
pub(crate) struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
    max_params: Option<usize>,
    rows: VecDeque<Vec<SqlValue>>,
    current: Option<Vec<SqlValue>>,
    executed: bool,
}

impl Statement {
    pub fn new(sql: &str, max_params: Option<usize>) -> Self {
        Self {
            sql: sql.to_string(),
            params: Vec::new(),
            max_params,
            rows: VecDeque::new(),
            current: None,
            executed: false,
        }
    }

    pub fn bind(&mut self, index: usize, value: SqlValue) -> Result<(), DbError> {
        if index == 0 || self.max_params.is_some_and(|max| index > max) {
            return Err(DbError::BindIndex(index));
        }
        if self.params.len() < index {
            self.params.resize(index, SqlValue::Null);
        }
        self.params[index - 1] = value;
        Ok(())
    }

    pub fn executed(&self) -> bool {
        self.executed
    }

    pub fn set_rows(&mut self, rows: Vec<Vec<SqlValue>>) {
        self.rows = rows.into();
        self.current = None;
        self.executed = true;
    }

    pub fn advance(&mut self) -> bool {
        self.current = self.rows.pop_front();
        self.current.is_some()
    }

    pub fn column(&self, col: usize) -> Result<&SqlValue, DbError> {
        let row = self.current.as_ref().ok_or(DbError::NoRow)?;
        col.checked_sub(1)
            .and_then(|index| row.get(index))
            .ok_or(DbError::Column(col))
    }
}
