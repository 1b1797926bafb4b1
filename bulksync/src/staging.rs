//! The staging table protocol: clone, bulk-load, drop.
//!
//! A staging table is a zero-row structural copy of the destination restricted to the
//! staged columns, optionally extended with the correlation id column. Rows are
//! streamed into it with binary COPY inside the active transaction; the table is
//! dropped best-effort once the set-based statement has consumed it.

use futures::pin_mut;
use pg_escape::quote_identifier;
use tokio_postgres::binary_copy::BinaryCopyInWriter;
use tokio_postgres::types::{ToSql, Type};
use tracing::{debug, warn};
use uuid::Uuid;

use bulksync_postgres::types::{ColumnSchema, TableDescriptor, TableName};

use crate::error::BulkResult;
use crate::executor::SqlExecutor;
use crate::stream::{BulkRecord, CorrelationMap, RowBinding};
use crate::types::Cell;

/// Name of the synthetic correlation id column appended to staging tables.
pub const CORRELATION_COLUMN: &str = "_staging_row_id";

/// Whether a staging table is session-temporary or a real table in the destination
/// schema. The protocol behaves identically apart from naming and cleanup policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StagingMode {
    #[default]
    Temporary,
    Permanent,
}

/// A live staging table created by [`clone_structure`].
#[derive(Debug, Clone)]
pub struct StagingTable {
    pub name: TableName,
    pub mode: StagingMode,
    /// Whether the correlation id column was added.
    pub correlation: bool,
}

impl StagingTable {
    /// Returns the staging table reference as it appears in statements.
    ///
    /// Temporary tables resolve through the session's temp schema and must not be
    /// schema-qualified; permanent tables live next to the destination.
    pub fn quoted_name(&self) -> String {
        match self.mode {
            StagingMode::Temporary => quote_identifier(&self.name.name).to_string(),
            StagingMode::Permanent => self.name.as_quoted_identifier(),
        }
    }
}

/// Derives a staging table name from the destination name plus a disambiguating
/// suffix, so concurrent callers against the same destination do not collide.
fn derive_staging_name(destination: &TableName) -> TableName {
    let suffix = Uuid::new_v4().simple().to_string();

    TableName::new(
        destination.schema.clone(),
        format!("{}_staging_{}", destination.name, &suffix[..8]),
    )
}

/// Creates a zero-row structural clone of the destination restricted to `columns`.
///
/// The clone carries column shape only: no constraints, indexes, or defaults. When
/// `correlation` is set, a nullable bigint correlation column is appended.
pub async fn clone_structure<E: SqlExecutor>(
    executor: &E,
    descriptor: &TableDescriptor,
    columns: &[&ColumnSchema],
    correlation: bool,
    mode: StagingMode,
) -> BulkResult<StagingTable> {
    let staging = StagingTable {
        name: derive_staging_name(&descriptor.name),
        mode,
        correlation,
    };

    let column_list = columns
        .iter()
        .map(|cs| quote_identifier(&cs.name).to_string())
        .collect::<Vec<_>>()
        .join(", ");

    let temporary = match mode {
        StagingMode::Temporary => "TEMPORARY ",
        StagingMode::Permanent => "",
    };
    let create = format!(
        "CREATE {}TABLE {} AS SELECT {} FROM {} LIMIT 0",
        temporary,
        staging.quoted_name(),
        column_list,
        descriptor.name.as_quoted_identifier(),
    );

    debug!(table = %staging.name, "creating staging table");
    executor.batch_execute(&create).await?;

    if correlation {
        let alter = format!(
            "ALTER TABLE {} ADD COLUMN {} bigint",
            staging.quoted_name(),
            quote_identifier(CORRELATION_COLUMN),
        );
        executor.batch_execute(&alter).await?;
    }

    Ok(staging)
}

/// Streams records into the staging table with binary COPY.
///
/// A batch size of 0 loads everything in a single COPY statement; otherwise one COPY
/// statement is issued per chunk of `batch_size` rows. When a correlation map is
/// supplied, each row gets the next id appended as its trailing field, assigned
/// lazily in stream order. Transport failures propagate unmodified.
pub async fn load<E, T>(
    executor: &E,
    staging: &StagingTable,
    columns: &[&ColumnSchema],
    binding: &RowBinding<T>,
    records: &[T],
    mut correlation: Option<&mut CorrelationMap>,
    batch_size: usize,
) -> BulkResult<u64>
where
    E: SqlExecutor,
    T: BulkRecord,
{
    if records.is_empty() {
        return Ok(0);
    }

    let mut column_list = columns
        .iter()
        .map(|cs| quote_identifier(&cs.name).to_string())
        .collect::<Vec<_>>();
    let mut column_types = columns.iter().map(|cs| cs.typ.clone()).collect::<Vec<_>>();
    if staging.correlation {
        column_list.push(quote_identifier(CORRELATION_COLUMN).to_string());
        column_types.push(Type::INT8);
    }

    let copy_sql = format!(
        "COPY {} ({}) FROM STDIN (FORMAT binary)",
        staging.quoted_name(),
        column_list.join(", "),
    );

    let chunk_size = if batch_size == 0 {
        records.len()
    } else {
        batch_size
    };

    let mut copied = 0u64;
    for batch in records.chunks(chunk_size) {
        let sink = executor.copy_in(&copy_sql).await?;
        let writer = BinaryCopyInWriter::new(sink, &column_types);
        pin_mut!(writer);

        for record in batch {
            let mut row = binding.row(record)?;
            if let Some(map) = correlation.as_deref_mut() {
                row.values_mut().push(Cell::I64(map.next_id()));
            }

            let values: Vec<&(dyn ToSql + Sync)> = row
                .values()
                .iter()
                .map(|cell| cell as &(dyn ToSql + Sync))
                .collect();
            writer.as_mut().write(&values).await?;
            copied += 1;
        }

        writer.finish().await?;
    }

    debug!(table = %staging.name, rows = copied, "staging table loaded");

    Ok(copied)
}

/// Drops the staging table, best-effort.
///
/// Cleanup failures are logged and swallowed so they never mask the outcome of the
/// operation that used the table.
pub async fn drop_staging<E: SqlExecutor>(executor: &E, staging: &StagingTable) {
    let drop = format!("DROP TABLE IF EXISTS {}", staging.quoted_name());

    if let Err(err) = executor.batch_execute(&drop).await {
        warn!(table = %staging.name, error = %err, "failed to drop staging table");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_name_pattern_and_uniqueness() {
        let destination = TableName::new("public".to_string(), "users".to_string());

        let first = derive_staging_name(&destination);
        let second = derive_staging_name(&destination);

        assert_eq!(first.schema, "public");
        assert!(first.name.starts_with("users_staging_"));
        assert_eq!(first.name.len(), "users_staging_".len() + 8);
        assert_ne!(first.name, second.name);
    }

    #[test]
    fn test_temporary_staging_is_not_schema_qualified() {
        let staging = StagingTable {
            name: TableName::new("public".to_string(), "users_staging_0a1b2c3d".to_string()),
            mode: StagingMode::Temporary,
            correlation: false,
        };

        assert_eq!(staging.quoted_name(), "users_staging_0a1b2c3d");
    }

    #[test]
    fn test_permanent_staging_is_schema_qualified() {
        let staging = StagingTable {
            name: TableName::new("sales".to_string(), "orders_staging_0a1b2c3d".to_string()),
            mode: StagingMode::Permanent,
            correlation: true,
        };

        assert_eq!(staging.quoted_name(), "sales.orders_staging_0a1b2c3d");
    }
}
