use pg_escape::quote_identifier;
use std::fmt;
use thiserror::Error;
use tokio_postgres::types::Type;

/// Errors that can occur while working with table descriptors.
#[derive(Debug, Error)]
pub enum DescriptorError {
    /// A column name was requested that does not exist in the descriptor.
    #[error("column not found in table descriptor: {0}")]
    UnknownColumn(String),
}

/// A fully qualified Postgres table name consisting of a schema and table name.
///
/// This type represents a table identifier in Postgres, which requires both a schema name
/// and a table name. It provides methods for formatting the name in different contexts.
#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Ord)]
pub struct TableName {
    /// The schema name containing the table
    pub schema: String,
    /// The name of the table within the schema
    pub name: String,
}

impl TableName {
    pub fn new(schema: String, name: String) -> TableName {
        Self { schema, name }
    }

    /// Returns the table name as a properly quoted Postgres identifier.
    ///
    /// This method ensures the schema and table names are properly escaped according to
    /// Postgres identifier quoting rules.
    pub fn as_quoted_identifier(&self) -> String {
        let quoted_schema = quote_identifier(&self.schema);
        let quoted_name = quote_identifier(&self.name);

        format!("{quoted_schema}.{quoted_name}")
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{0}.{1}", self.schema, self.name))
    }
}

/// Represents the schema of a single column in a Postgres table.
///
/// This type contains all metadata a bulk operation needs about a column: its name,
/// data type, primary key information, nullability, and whether its value is generated
/// by the database (identity or computed).
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    /// The name of the column.
    pub name: String,
    /// The Postgres data type of the column.
    pub typ: Type,
    /// The 1-based ordinal position of this column in the primary key, or None if not a primary key.
    pub primary_key_ordinal_position: Option<i32>,
    /// Whether the column can contain NULL values.
    pub nullable: bool,
    /// Whether the column value is assigned by an identity sequence.
    pub identity: bool,
    /// Whether the column value is computed by the database (generated column).
    pub computed: bool,
}

impl ColumnSchema {
    /// Creates a new [`ColumnSchema`] with all fields specified.
    pub fn new(
        name: String,
        typ: Type,
        primary_key_ordinal_position: Option<i32>,
        nullable: bool,
        identity: bool,
        computed: bool,
    ) -> ColumnSchema {
        Self {
            name,
            typ,
            primary_key_ordinal_position,
            nullable,
            identity,
            computed,
        }
    }

    /// Returns whether this column is part of the table's primary key.
    pub fn primary_key(&self) -> bool {
        self.primary_key_ordinal_position.is_some()
    }

    /// Returns whether this column's value is assigned by the database.
    pub fn generated(&self) -> bool {
        self.identity || self.computed
    }
}

/// A fixed discriminator predicate attached to a table descriptor.
///
/// Single-table-per-hierarchy mappings pin one or more columns to a constant value.
/// The value is stored as the unquoted literal text and is quoted when rendered
/// into a statement.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedCondition {
    /// The discriminator column name.
    pub column: String,
    /// The literal value the column is pinned to.
    pub value: String,
}

impl FixedCondition {
    pub fn new(column: String, value: String) -> FixedCondition {
        Self { column, value }
    }
}

/// The immutable per-entity table descriptor consumed by every bulk operation.
///
/// Resolved once per operation from the external metadata collaborator (or from the
/// Postgres catalogs) and read-only afterward.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDescriptor {
    /// The fully qualified name of the destination table.
    pub name: TableName,
    /// The schemas of all columns in the table, in ordinal order.
    pub column_schemas: Vec<ColumnSchema>,
    /// Fixed discriminator column/value pairs, empty for plain tables.
    pub conditions: Vec<FixedCondition>,
}

impl TableDescriptor {
    /// Creates a new [`TableDescriptor`] without fixed conditions.
    pub fn new(name: TableName, column_schemas: Vec<ColumnSchema>) -> Self {
        Self::with_conditions(name, column_schemas, Vec::new())
    }

    /// Creates a new [`TableDescriptor`] with fixed discriminator conditions.
    pub fn with_conditions(
        name: TableName,
        column_schemas: Vec<ColumnSchema>,
        conditions: Vec<FixedCondition>,
    ) -> Self {
        Self {
            name,
            column_schemas,
            conditions,
        }
    }

    /// Looks up a column schema by name.
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.column_schemas.iter().find(|cs| cs.name == name)
    }

    /// Looks up a column schema by name, failing when it does not exist.
    pub fn require_column(&self, name: &str) -> Result<&ColumnSchema, DescriptorError> {
        self.column(name)
            .ok_or_else(|| DescriptorError::UnknownColumn(name.to_string()))
    }

    /// Returns the primary key columns in key ordinal order.
    pub fn primary_key_columns(&self) -> Vec<&ColumnSchema> {
        let mut keys: Vec<&ColumnSchema> = self
            .column_schemas
            .iter()
            .filter(|cs| cs.primary_key())
            .collect();
        keys.sort_by_key(|cs| cs.primary_key_ordinal_position);

        keys
    }

    /// Returns whether the table has any primary key columns.
    pub fn has_primary_keys(&self) -> bool {
        self.column_schemas.iter().any(|cs| cs.primary_key())
    }

    /// Returns the columns whose values are assigned by the database.
    pub fn generated_columns(&self) -> Vec<&ColumnSchema> {
        self.column_schemas
            .iter()
            .filter(|cs| cs.generated())
            .collect()
    }

    /// Returns whether the named column is pinned by a fixed condition.
    pub fn is_condition_column(&self, name: &str) -> bool {
        self.conditions.iter().any(|c| c.column == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_descriptor() -> TableDescriptor {
        TableDescriptor::new(
            TableName::new("public".to_string(), "users".to_string()),
            vec![
                ColumnSchema::new("id".to_string(), Type::INT8, Some(1), false, true, false),
                ColumnSchema::new("name".to_string(), Type::TEXT, None, true, false, false),
                ColumnSchema::new("age".to_string(), Type::INT4, None, true, false, false),
                ColumnSchema::new(
                    "full_name".to_string(),
                    Type::TEXT,
                    None,
                    true,
                    false,
                    true,
                ),
            ],
        )
    }

    #[test]
    fn test_quoted_identifier_escapes_reserved_names() {
        let name = TableName::new("public".to_string(), "order".to_string());
        assert_eq!(name.as_quoted_identifier(), r#"public."order""#);
    }

    #[test]
    fn test_primary_key_columns_in_key_order() {
        let descriptor = TableDescriptor::new(
            TableName::new("public".to_string(), "t".to_string()),
            vec![
                ColumnSchema::new("b".to_string(), Type::INT4, Some(2), false, false, false),
                ColumnSchema::new("a".to_string(), Type::INT4, Some(1), false, false, false),
            ],
        );

        let keys: Vec<&str> = descriptor
            .primary_key_columns()
            .iter()
            .map(|cs| cs.name.as_str())
            .collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_generated_columns_include_identity_and_computed() {
        let descriptor = create_test_descriptor();
        let generated: Vec<&str> = descriptor
            .generated_columns()
            .iter()
            .map(|cs| cs.name.as_str())
            .collect();

        assert_eq!(generated, vec!["id", "full_name"]);
    }

    #[test]
    fn test_require_column_unknown() {
        let descriptor = create_test_descriptor();
        let err = descriptor.require_column("missing").unwrap_err();

        assert!(matches!(err, DescriptorError::UnknownColumn(name) if name == "missing"));
    }

    #[test]
    fn test_is_condition_column() {
        let descriptor = TableDescriptor::with_conditions(
            TableName::new("public".to_string(), "animals".to_string()),
            vec![ColumnSchema::new(
                "kind".to_string(),
                Type::TEXT,
                None,
                false,
                false,
                false,
            )],
            vec![FixedCondition::new("kind".to_string(), "dog".to_string())],
        );

        assert!(descriptor.is_condition_column("kind"));
        assert!(!descriptor.is_condition_column("name"));
    }
}
