//! The row stream adapter: turns in-memory collections into sequential rows whose
//! field order matches a filtered column list.
//!
//! Accessors are built once per column when the binding is created, not once per row.
//! That is the dominant performance path for large collections; the per-row work is a
//! plain indexed call through the cached accessor.

use bulksync_postgres::types::{ColumnSchema, TableDescriptor};

use crate::error::{BulkResult, ErrorKind};
use crate::types::{Cell, TableRow};
use crate::{bail, bulk_error};

/// A cached accessor resolving one column's value from a record.
///
/// Built once per column and reused for every row in the stream.
pub type ColumnAccessor<T> = Box<dyn Fn(&T) -> BulkResult<Cell> + Send + Sync>;

/// A record type that can be streamed into a staging table.
///
/// Three shapes are supported: scalar elements ([`Cell`] streams itself), loosely-typed
/// dynamic records ([`serde_json::Value`] resolves fields by name at read time), and
/// strongly-typed structs (the caller implements [`BulkRecord::accessor`] returning a
/// closure per column).
pub trait BulkRecord: Send + Sync {
    /// Returns an accessor for the given column, or `None` when the record has no
    /// field for it. Called once per column when a binding is built.
    fn accessor(column: &ColumnSchema) -> Option<ColumnAccessor<Self>>
    where
        Self: Sized;

    /// Writes a database-generated column value back onto the record.
    ///
    /// Called after a set-based statement returns output rows, once per generated
    /// column per affected record.
    fn write_generated(&mut self, column: &ColumnSchema, value: Cell) -> BulkResult<()> {
        let _ = value;
        bail!(
            ErrorKind::ConversionError,
            "Record type does not accept generated values",
            format!("no writable field for generated column '{}'", column.name)
        );
    }
}

impl BulkRecord for Cell {
    fn accessor(_column: &ColumnSchema) -> Option<ColumnAccessor<Self>> {
        Some(Box::new(|record: &Cell| Ok(record.clone())))
    }

    fn write_generated(&mut self, _column: &ColumnSchema, value: Cell) -> BulkResult<()> {
        *self = value;
        Ok(())
    }
}

impl BulkRecord for serde_json::Value {
    fn accessor(column: &ColumnSchema) -> Option<ColumnAccessor<Self>> {
        let name = column.name.clone();
        let typ = column.typ.clone();

        Some(Box::new(move |record: &serde_json::Value| {
            let field = record.get(&name).ok_or_else(|| {
                bulk_error!(
                    ErrorKind::ConversionError,
                    "Field not found in dynamic record",
                    format!("record has no field named '{name}'")
                )
            })?;

            Cell::from_json(field, &typ)
        }))
    }

    fn write_generated(&mut self, column: &ColumnSchema, value: Cell) -> BulkResult<()> {
        match self {
            serde_json::Value::Object(fields) => {
                fields.insert(column.name.clone(), value.to_json());
                Ok(())
            }
            _ => bail!(
                ErrorKind::ConversionError,
                "Dynamic record is not an object",
                format!("cannot write generated column '{}'", column.name)
            ),
        }
    }
}

/// An explicit column filter applied before building a binding.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ColumnSelection {
    /// All columns the operation would naturally use.
    #[default]
    All,
    /// Only the named columns.
    Include(Vec<String>),
    /// All columns except the named ones.
    Exclude(Vec<String>),
}

/// Applies a [`ColumnSelection`] to a descriptor's columns, preserving ordinal order.
///
/// An include list naming a column the descriptor does not have is fatal.
pub fn select_columns<'a>(
    descriptor: &'a TableDescriptor,
    selection: &ColumnSelection,
) -> BulkResult<Vec<&'a ColumnSchema>> {
    match selection {
        ColumnSelection::All => Ok(descriptor.column_schemas.iter().collect()),
        ColumnSelection::Include(names) => {
            for name in names {
                descriptor.require_column(name)?;
            }

            Ok(descriptor
                .column_schemas
                .iter()
                .filter(|cs| names.iter().any(|n| *n == cs.name))
                .collect())
        }
        ColumnSelection::Exclude(names) => Ok(descriptor
            .column_schemas
            .iter()
            .filter(|cs| !names.iter().any(|n| *n == cs.name))
            .collect()),
    }
}

/// A set of per-column accessors built once for a filtered column list.
pub struct RowBinding<T> {
    accessors: Vec<(String, ColumnAccessor<T>)>,
}

impl<T: BulkRecord> RowBinding<T> {
    /// Builds accessors for each column in order.
    ///
    /// A column with no accessor on the record type is fatal and aborts the stream
    /// before any row is produced.
    pub fn bind(columns: &[&ColumnSchema]) -> BulkResult<Self> {
        let mut accessors = Vec::with_capacity(columns.len());

        for column in columns {
            let Some(accessor) = T::accessor(column) else {
                bail!(
                    ErrorKind::ConversionError,
                    "Record type has no accessor for column",
                    format!("cannot resolve column '{}'", column.name)
                );
            };

            accessors.push((column.name.clone(), accessor));
        }

        Ok(Self { accessors })
    }

    /// Produces one row from a record, in bound column order.
    pub fn row(&self, record: &T) -> BulkResult<TableRow> {
        let mut values = Vec::with_capacity(self.accessors.len() + 1);
        for (_, accessor) in &self.accessors {
            values.push(accessor(record)?);
        }

        Ok(TableRow::new(values))
    }

    /// Returns the bound column names in order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.accessors.iter().map(|(name, _)| name.as_str())
    }
}

/// Maps synthetic correlation ids back to source record positions.
///
/// Ids are assigned lazily in stream order starting at 1, exactly once per row, as
/// rows are pulled by the bulk-copy writer. After the load completes the map resolves
/// an id from a statement's output row back to the index of the originating record.
#[derive(Debug, Default)]
pub struct CorrelationMap {
    assigned: u64,
}

impl CorrelationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns the next correlation id, in stream order.
    pub fn next_id(&mut self) -> i64 {
        self.assigned += 1;
        self.assigned as i64
    }

    /// Returns the number of rows streamed so far.
    pub fn len(&self) -> u64 {
        self.assigned
    }

    pub fn is_empty(&self) -> bool {
        self.assigned == 0
    }

    /// Resolves a correlation id to the 0-based index of the originating record.
    pub fn index_of(&self, id: i64) -> BulkResult<usize> {
        if id < 1 || id as u64 > self.assigned {
            bail!(
                ErrorKind::InvalidState,
                "Correlation id out of range",
                format!("id {id} not in 1..={}", self.assigned)
            );
        }

        Ok((id - 1) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulksync_postgres::types::TableName;
    use tokio_postgres::types::Type;

    fn create_test_descriptor() -> TableDescriptor {
        TableDescriptor::new(
            TableName::new("public".to_string(), "users".to_string()),
            vec![
                ColumnSchema::new("id".to_string(), Type::INT8, Some(1), false, true, false),
                ColumnSchema::new("name".to_string(), Type::TEXT, None, true, false, false),
                ColumnSchema::new("age".to_string(), Type::INT4, None, true, false, false),
            ],
        )
    }

    #[test]
    fn test_select_columns_include_preserves_ordinal_order() {
        let descriptor = create_test_descriptor();
        let selection = ColumnSelection::Include(vec!["age".to_string(), "id".to_string()]);

        let columns = select_columns(&descriptor, &selection).unwrap();
        let names: Vec<&str> = columns.iter().map(|cs| cs.name.as_str()).collect();

        assert_eq!(names, vec!["id", "age"]);
    }

    #[test]
    fn test_select_columns_include_unknown_column_fails() {
        let descriptor = create_test_descriptor();
        let selection = ColumnSelection::Include(vec!["missing".to_string()]);

        let err = select_columns(&descriptor, &selection).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaError);
    }

    #[test]
    fn test_select_columns_exclude() {
        let descriptor = create_test_descriptor();
        let selection = ColumnSelection::Exclude(vec!["name".to_string()]);

        let columns = select_columns(&descriptor, &selection).unwrap();
        let names: Vec<&str> = columns.iter().map(|cs| cs.name.as_str()).collect();

        assert_eq!(names, vec!["id", "age"]);
    }

    #[test]
    fn test_dynamic_record_rows_follow_column_order() {
        let descriptor = create_test_descriptor();
        let columns = select_columns(&descriptor, &ColumnSelection::All).unwrap();
        let binding = RowBinding::<serde_json::Value>::bind(&columns).unwrap();

        let record = serde_json::json!({"id": 7, "name": "ada", "age": 36});
        let row = binding.row(&record).unwrap();

        assert_eq!(
            row.values(),
            &[
                Cell::I64(7),
                Cell::String("ada".to_string()),
                Cell::I32(36)
            ]
        );
    }

    #[test]
    fn test_dynamic_record_missing_field_is_fatal() {
        let descriptor = create_test_descriptor();
        let columns = select_columns(&descriptor, &ColumnSelection::All).unwrap();
        let binding = RowBinding::<serde_json::Value>::bind(&columns).unwrap();

        let record = serde_json::json!({"id": 7, "age": 36});
        let err = binding.row(&record).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConversionError);
    }

    #[test]
    fn test_scalar_record_streams_itself() {
        let column = ColumnSchema::new("v".to_string(), Type::INT4, None, true, false, false);
        let columns = vec![&column];
        let binding = RowBinding::<Cell>::bind(&columns).unwrap();

        let row = binding.row(&Cell::I32(11)).unwrap();
        assert_eq!(row.values(), &[Cell::I32(11)]);
    }

    #[test]
    fn test_correlation_ids_are_one_based_stream_order() {
        let mut map = CorrelationMap::new();

        assert_eq!(map.next_id(), 1);
        assert_eq!(map.next_id(), 2);
        assert_eq!(map.next_id(), 3);
        assert_eq!(map.len(), 3);

        assert_eq!(map.index_of(1).unwrap(), 0);
        assert_eq!(map.index_of(3).unwrap(), 2);
        assert!(map.index_of(0).is_err());
        assert!(map.index_of(4).is_err());
    }

    #[test]
    fn test_generated_write_back_on_dynamic_record() {
        let column = ColumnSchema::new("id".to_string(), Type::INT8, Some(1), false, true, false);
        let mut record = serde_json::json!({"name": "ada"});

        record.write_generated(&column, Cell::I64(99)).unwrap();
        assert_eq!(record["id"], serde_json::json!(99));
    }
}
