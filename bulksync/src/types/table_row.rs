use crate::types::cell::Cell;

/// Represents a complete row of data bound for a staging table.
///
/// [`TableRow`] contains a vector of [`Cell`] values corresponding to the columns
/// of the staged column list. The values are ordered to match the column order used
/// when the staging table was cloned.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    /// Column values in staged column order.
    values: Vec<Cell>,
}

impl TableRow {
    /// Creates a new table row with the given cell values.
    pub fn new(values: Vec<Cell>) -> Self {
        Self { values }
    }

    /// Returns the row values in staged column order.
    pub fn values(&self) -> &[Cell] {
        &self.values
    }

    /// Returns mutable access to row values in staged column order.
    pub fn values_mut(&mut self) -> &mut Vec<Cell> {
        &mut self.values
    }

    /// Consumes the row and returns its values in staged column order.
    pub fn into_values(self) -> Vec<Cell> {
        self.values
    }
}
