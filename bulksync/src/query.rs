//! A read query paired with its bind parameters.

use crate::types::Cell;

/// A SELECT statement plus positional bind parameters, used as the input to the
/// query-shaped operations (delete-from-query, update-from-query, insert-from-query).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadQuery {
    pub sql: String,
    pub params: Vec<Cell>,
}

impl ReadQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Appends a bind parameter, returning the query for chaining.
    pub fn bind(mut self, param: impl Into<Cell>) -> Self {
        self.params.push(param.into());
        self
    }
}
