//! Resolves table descriptors from the Postgres catalogs.
//!
//! Descriptors are normally supplied by the caller's own metadata layer; this module
//! covers the standalone case where the database itself is the source of truth.

use tracing::debug;

use bulksync_postgres::types::{ColumnSchema, TableDescriptor, TableName, convert_type_oid_to_type};

use crate::bail;
use crate::error::{BulkResult, ErrorKind};
use crate::executor::SqlExecutor;

/// Reads the column shape of a table from the catalogs and builds a descriptor.
///
/// Captures name, type, primary key ordinal, nullability, and whether the value is
/// database-assigned (identity or generated). Fails when the table does not exist.
pub async fn fetch_table_descriptor<E: SqlExecutor>(
    executor: &E,
    table: &TableName,
) -> BulkResult<TableDescriptor> {
    let sql = "
        SELECT
            a.attname,
            a.atttypid,
            a.attnotnull,
            a.attidentity <> '' AS identity,
            a.attgenerated <> '' AS generated,
            p.key_position::int4 AS key_position
        FROM pg_attribute a
        JOIN pg_class c ON c.oid = a.attrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        LEFT JOIN LATERAL (
            SELECT array_position(i.indkey::int2[], a.attnum) AS key_position
            FROM pg_index i
            WHERE i.indrelid = c.oid AND i.indisprimary
        ) p ON true
        WHERE n.nspname = $1
          AND c.relname = $2
          AND a.attnum > 0
          AND NOT a.attisdropped
        ORDER BY a.attnum";

    let rows = executor
        .query(sql, &[&table.schema, &table.name])
        .await?;

    if rows.is_empty() {
        bail!(
            ErrorKind::SchemaError,
            "Table not found in the catalogs",
            format!("table '{table}'")
        );
    }

    let mut column_schemas = Vec::with_capacity(rows.len());
    for row in &rows {
        let name: String = row.try_get("attname")?;
        let type_oid: u32 = row.try_get("atttypid")?;
        let not_null: bool = row.try_get("attnotnull")?;
        let identity: bool = row.try_get("identity")?;
        let generated: bool = row.try_get("generated")?;
        let key_position: Option<i32> = row.try_get("key_position")?;

        column_schemas.push(ColumnSchema::new(
            name,
            convert_type_oid_to_type(type_oid),
            key_position,
            !not_null,
            identity,
            generated,
        ));
    }

    debug!(table = %table, columns = column_schemas.len(), "table descriptor resolved");

    Ok(TableDescriptor::new(table.clone(), column_schemas))
}

/// Returns whether a table exists in the catalogs.
pub async fn table_exists<E: SqlExecutor>(executor: &E, table: &TableName) -> BulkResult<bool> {
    let sql = "
        SELECT 1
        FROM pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = $1 AND c.relname = $2 AND c.relkind IN ('r', 'p')";

    let matched = executor.execute(sql, &[&table.schema, &table.name]).await?;

    Ok(matched > 0)
}
