//! Bulk operation orchestration: resolve columns, stage, execute, classify, clean up.
//!
//! Every collection-shaped operation follows the same sequence: validate inputs
//! before touching the database, clone a staging table, bulk-load it, run one
//! set-based statement that consumes it, and drop the staging table. The operations
//! are written against [`SqlExecutor`] so they run identically inside an owned
//! transaction ([`BulkClient`]) or a caller-supplied one ([`BulkOps`]).

use std::time::Duration;

use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Transaction};
use tracing::info;

use bulksync_postgres::types::{ColumnSchema, TableDescriptor, TableName};

use crate::bail;
use crate::error::{BulkResult, ErrorKind};
use crate::executor::{SqlExecutor, connect};
use crate::expr::{ColumnPair, JoinCondition, Projection, resolve_join_columns};
use crate::merge::{
    MergeAction, MergeStatement, OutputRow, build_delete_join, build_update_join, parse_output_rows,
};
use crate::query::ReadQuery;
use crate::rewrite::ClauseList;
use crate::schema::table_exists;
use crate::staging::{StagingMode, clone_structure, drop_staging, load};
use crate::stream::{BulkRecord, ColumnSelection, CorrelationMap, RowBinding, select_columns};

/// Options for [`BulkClient::bulk_insert`].
#[derive(Debug, Clone, Default)]
pub struct InsertOptions {
    /// Which destination columns to stream.
    pub columns: ColumnSelection,
    /// Insert explicit values into identity columns instead of drawing from the
    /// sequence.
    pub keep_identity: bool,
    /// Read database-assigned values back onto the records after the insert.
    pub fetch_generated: bool,
    /// Skip records that already have a matching destination row instead of
    /// failing on the constraint.
    pub insert_if_not_exists: bool,
    /// Match condition for conflict avoidance; defaults to the primary key and
    /// implies [`InsertOptions::insert_if_not_exists`].
    pub condition: Option<JoinCondition>,
    /// Rows per COPY statement; 0 loads everything in one statement.
    pub batch_size: usize,
    pub staging_mode: StagingMode,
    /// Per-statement timeout for this operation, overriding the client default.
    pub command_timeout: Option<Duration>,
    /// Leave the staging table behind for diagnostics instead of dropping it.
    pub keep_staging_table: bool,
}

impl InsertOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_columns(mut self, columns: ColumnSelection) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_insert_if_not_exists(mut self, insert_if_not_exists: bool) -> Self {
        self.insert_if_not_exists = insert_if_not_exists;
        self
    }

    pub fn with_condition(mut self, condition: JoinCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_keep_identity(mut self, keep_identity: bool) -> Self {
        self.keep_identity = keep_identity;
        self
    }

    pub fn with_fetch_generated(mut self, fetch_generated: bool) -> Self {
        self.fetch_generated = fetch_generated;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_staging_mode(mut self, staging_mode: StagingMode) -> Self {
        self.staging_mode = staging_mode;
        self
    }

    pub fn with_command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = Some(command_timeout);
        self
    }

    pub fn with_keep_staging_table(mut self, keep_staging_table: bool) -> Self {
        self.keep_staging_table = keep_staging_table;
        self
    }
}

/// Options for [`BulkClient::bulk_update`].
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Which destination columns to assign.
    pub columns: ColumnSelection,
    /// Custom match condition; defaults to the primary key.
    pub condition: Option<JoinCondition>,
    pub batch_size: usize,
    pub staging_mode: StagingMode,
    /// Per-statement timeout for this operation, overriding the client default.
    pub command_timeout: Option<Duration>,
    /// Leave the staging table behind for diagnostics instead of dropping it.
    pub keep_staging_table: bool,
}

impl UpdateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_columns(mut self, columns: ColumnSelection) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_condition(mut self, condition: JoinCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_staging_mode(mut self, staging_mode: StagingMode) -> Self {
        self.staging_mode = staging_mode;
        self
    }

    pub fn with_command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = Some(command_timeout);
        self
    }

    pub fn with_keep_staging_table(mut self, keep_staging_table: bool) -> Self {
        self.keep_staging_table = keep_staging_table;
        self
    }
}

/// Options for [`BulkClient::bulk_delete`].
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    /// Custom match condition; defaults to the primary key.
    pub condition: Option<JoinCondition>,
    pub batch_size: usize,
    pub staging_mode: StagingMode,
    /// Per-statement timeout for this operation, overriding the client default.
    pub command_timeout: Option<Duration>,
    /// Leave the staging table behind for diagnostics instead of dropping it.
    pub keep_staging_table: bool,
}

impl DeleteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_condition(mut self, condition: JoinCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_staging_mode(mut self, staging_mode: StagingMode) -> Self {
        self.staging_mode = staging_mode;
        self
    }

    pub fn with_command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = Some(command_timeout);
        self
    }

    pub fn with_keep_staging_table(mut self, keep_staging_table: bool) -> Self {
        self.keep_staging_table = keep_staging_table;
        self
    }
}

/// Options for [`BulkClient::bulk_merge`] and [`BulkClient::bulk_sync`].
#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    /// Columns written by the not-matched insert branch.
    pub insert_columns: ColumnSelection,
    /// Columns assigned by the matched update branch.
    pub update_columns: ColumnSelection,
    pub condition: Option<JoinCondition>,
    pub keep_identity: bool,
    pub fetch_generated: bool,
    pub batch_size: usize,
    pub staging_mode: StagingMode,
    /// Per-statement timeout for this operation, overriding the client default.
    pub command_timeout: Option<Duration>,
    /// Leave the staging table behind for diagnostics instead of dropping it.
    pub keep_staging_table: bool,
}

impl MergeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_insert_columns(mut self, insert_columns: ColumnSelection) -> Self {
        self.insert_columns = insert_columns;
        self
    }

    pub fn with_update_columns(mut self, update_columns: ColumnSelection) -> Self {
        self.update_columns = update_columns;
        self
    }

    pub fn with_condition(mut self, condition: JoinCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_keep_identity(mut self, keep_identity: bool) -> Self {
        self.keep_identity = keep_identity;
        self
    }

    pub fn with_fetch_generated(mut self, fetch_generated: bool) -> Self {
        self.fetch_generated = fetch_generated;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_staging_mode(mut self, staging_mode: StagingMode) -> Self {
        self.staging_mode = staging_mode;
        self
    }

    pub fn with_command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = Some(command_timeout);
        self
    }

    pub fn with_keep_staging_table(mut self, keep_staging_table: bool) -> Self {
        self.keep_staging_table = keep_staging_table;
        self
    }
}

/// The outcome of a bulk operation, broken down by action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkReport {
    pub rows_affected: u64,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub rows_deleted: u64,
    /// Per-row action tags in statement output order; populated by merge and sync.
    pub actions: Vec<MergeAction>,
}

impl BulkReport {
    fn inserted(count: u64) -> Self {
        Self {
            rows_affected: count,
            rows_inserted: count,
            ..Default::default()
        }
    }

    fn updated(count: u64) -> Self {
        Self {
            rows_affected: count,
            rows_updated: count,
            ..Default::default()
        }
    }

    fn deleted(count: u64) -> Self {
        Self {
            rows_affected: count,
            rows_deleted: count,
            ..Default::default()
        }
    }
}

/// Tallies merge output rows into a report.
///
/// Every output row counts toward exactly one per-action counter, so the counters
/// always sum to `rows_affected` and `actions` keeps the statement output order.
fn classify_output(rows: &[OutputRow]) -> BulkReport {
    let mut report = BulkReport::default();
    for row in rows {
        report.rows_affected += 1;
        match row.action {
            MergeAction::Insert => report.rows_inserted += 1,
            MergeAction::Update => report.rows_updated += 1,
            MergeAction::Delete => report.rows_deleted += 1,
        }
        report.actions.push(row.action);
    }

    report
}

/// The columns an insert branch writes: every streamable column of the selection,
/// minus computed columns, minus discriminator columns, minus identity columns
/// unless explicitly kept.
fn insert_columns<'a>(
    descriptor: &'a TableDescriptor,
    selection: &ColumnSelection,
    keep_identity: bool,
) -> BulkResult<Vec<&'a ColumnSchema>> {
    let columns: Vec<&ColumnSchema> = select_columns(descriptor, selection)?
        .into_iter()
        .filter(|cs| !cs.computed)
        .filter(|cs| keep_identity || !cs.identity)
        .filter(|cs| !descriptor.is_condition_column(&cs.name))
        .collect();

    if columns.is_empty() {
        bail!(
            ErrorKind::UnsupportedExpression,
            "No streamable columns remain after filtering",
            format!("table '{}'", descriptor.name)
        );
    }

    Ok(columns)
}

/// The columns an update branch assigns: streamable columns minus the join targets.
fn update_columns<'a>(
    descriptor: &'a TableDescriptor,
    selection: &ColumnSelection,
    pairs: &[ColumnPair],
) -> BulkResult<Vec<&'a ColumnSchema>> {
    let columns: Vec<&ColumnSchema> = select_columns(descriptor, selection)?
        .into_iter()
        .filter(|cs| !cs.generated())
        .filter(|cs| !descriptor.is_condition_column(&cs.name))
        .filter(|cs| !pairs.iter().any(|pair| pair.target == cs.name))
        .collect();

    if columns.is_empty() {
        bail!(
            ErrorKind::UnsupportedExpression,
            "No assignable columns remain after filtering",
            format!("table '{}'", descriptor.name)
        );
    }

    Ok(columns)
}

/// Extends `columns` with the join source columns that are not already staged, in
/// descriptor ordinal order. Source columns must exist on the destination since the
/// staging table is cloned from it.
fn with_join_sources<'a>(
    descriptor: &'a TableDescriptor,
    columns: Vec<&'a ColumnSchema>,
    pairs: &[ColumnPair],
) -> BulkResult<Vec<&'a ColumnSchema>> {
    let mut names: Vec<&str> = columns.iter().map(|cs| cs.name.as_str()).collect();
    for pair in pairs {
        descriptor.require_column(&pair.source)?;
        if !names.contains(&pair.source.as_str()) {
            names.push(&pair.source);
        }
    }

    Ok(descriptor
        .column_schemas
        .iter()
        .filter(|cs| names.contains(&cs.name.as_str()))
        .collect())
}

/// Writes database-assigned values from parsed statement output back onto the
/// records that produced them.
fn write_back<T: BulkRecord>(
    records: &mut [T],
    map: &CorrelationMap,
    generated: &[&ColumnSchema],
    rows: &[crate::merge::OutputRow],
) -> BulkResult<()> {
    for row in rows {
        if row.action == MergeAction::Delete {
            continue;
        }
        let Some(id) = row.correlation_id else {
            bail!(
                ErrorKind::InvalidState,
                "Statement output row has no correlation id"
            );
        };

        let index = map.index_of(id)?;
        for (column, value) in generated.iter().zip(row.generated.iter()) {
            records[index].write_generated(column, value.clone())?;
        }
    }

    Ok(())
}

/// Inserts a collection of records, optionally reading generated values back.
pub async fn run_insert<E, T>(
    executor: &E,
    descriptor: &TableDescriptor,
    records: &mut [T],
    options: &InsertOptions,
) -> BulkResult<BulkReport>
where
    E: SqlExecutor,
    T: BulkRecord,
{
    if records.is_empty() {
        return Ok(BulkReport::default());
    }

    let columns = insert_columns(descriptor, &options.columns, options.keep_identity)?;

    // A conflict-avoidance condition turns the statement into a keyed merge whose
    // matched rows are silently skipped.
    let conditional = options.insert_if_not_exists || options.condition.is_some();
    let (pairs, staged) = if conditional {
        let pairs = resolve_join_columns(descriptor, options.condition.as_ref())?;
        let staged = with_join_sources(descriptor, columns.clone(), &pairs)?;
        (pairs, staged)
    } else {
        (Vec::new(), columns.clone())
    };
    let binding = RowBinding::bind(&staged)?;

    let generated = descriptor.generated_columns();
    let fetch_generated = options.fetch_generated && !generated.is_empty();

    let staging = clone_structure(
        executor,
        descriptor,
        &staged,
        fetch_generated,
        options.staging_mode,
    )
    .await?;

    let outcome: BulkResult<BulkReport> = async {
        let mut map = CorrelationMap::new();
        let correlation = fetch_generated.then_some(&mut map);
        load(
            executor,
            &staging,
            &staged,
            &binding,
            records,
            correlation,
            options.batch_size,
        )
        .await?;

        let statement = MergeStatement {
            descriptor,
            staging: &staging,
            insert_columns: Some(&columns),
            update_columns: None,
            join: &pairs,
            unconditional: !conditional,
            delete_unmatched: false,
            keep_identity: options.keep_identity,
            returning: if fetch_generated { &generated } else { &[] },
            with_output: fetch_generated,
        };
        let sql = statement.render();

        let inserted = if fetch_generated {
            let rows = executor.query(&sql, &[]).await?;
            let parsed = parse_output_rows(&rows, &generated)?;
            write_back(records, &map, &generated, &parsed)?;
            parsed.len() as u64
        } else {
            executor.execute(&sql, &[]).await?
        };

        Ok(BulkReport::inserted(inserted))
    }
    .await;

    if !options.keep_staging_table {
        drop_staging(executor, &staging).await;
    }

    let report = outcome?;
    info!(
        table = %descriptor.name,
        rows = report.rows_inserted,
        "bulk insert completed"
    );

    Ok(report)
}

/// Updates matching destination rows from a collection of records.
pub async fn run_update<E, T>(
    executor: &E,
    descriptor: &TableDescriptor,
    records: &[T],
    options: &UpdateOptions,
) -> BulkResult<BulkReport>
where
    E: SqlExecutor,
    T: BulkRecord,
{
    if records.is_empty() {
        return Ok(BulkReport::default());
    }

    let pairs = resolve_join_columns(descriptor, options.condition.as_ref())?;
    let assigned = update_columns(descriptor, &options.columns, &pairs)?;
    let staged = with_join_sources(descriptor, assigned.clone(), &pairs)?;
    let binding = RowBinding::bind(&staged)?;

    let staging =
        clone_structure(executor, descriptor, &staged, false, options.staging_mode).await?;

    let outcome: BulkResult<BulkReport> = async {
        load(
            executor,
            &staging,
            &staged,
            &binding,
            records,
            None,
            options.batch_size,
        )
        .await?;

        let sql = build_update_join(descriptor, &staging, &assigned, &pairs);
        let updated = executor.execute(&sql, &[]).await?;

        Ok(BulkReport::updated(updated))
    }
    .await;

    if !options.keep_staging_table {
        drop_staging(executor, &staging).await;
    }

    let report = outcome?;
    info!(
        table = %descriptor.name,
        rows = report.rows_updated,
        "bulk update completed"
    );

    Ok(report)
}

/// Deletes destination rows matched by a collection of records.
pub async fn run_delete<E, T>(
    executor: &E,
    descriptor: &TableDescriptor,
    records: &[T],
    options: &DeleteOptions,
) -> BulkResult<BulkReport>
where
    E: SqlExecutor,
    T: BulkRecord,
{
    if records.is_empty() {
        return Ok(BulkReport::default());
    }

    let pairs = resolve_join_columns(descriptor, options.condition.as_ref())?;
    let staged = with_join_sources(descriptor, Vec::new(), &pairs)?;
    let binding = RowBinding::bind(&staged)?;

    let staging =
        clone_structure(executor, descriptor, &staged, false, options.staging_mode).await?;

    let outcome: BulkResult<BulkReport> = async {
        load(
            executor,
            &staging,
            &staged,
            &binding,
            records,
            None,
            options.batch_size,
        )
        .await?;

        let sql = build_delete_join(descriptor, &staging, &pairs);
        let deleted = executor.execute(&sql, &[]).await?;

        Ok(BulkReport::deleted(deleted))
    }
    .await;

    if !options.keep_staging_table {
        drop_staging(executor, &staging).await;
    }

    let report = outcome?;
    info!(
        table = %descriptor.name,
        rows = report.rows_deleted,
        "bulk delete completed"
    );

    Ok(report)
}

/// Upserts a collection of records; with `delete_unmatched` the destination is fully
/// synchronized to the collection.
pub async fn run_merge<E, T>(
    executor: &E,
    descriptor: &TableDescriptor,
    records: &mut [T],
    options: &MergeOptions,
    delete_unmatched: bool,
) -> BulkResult<BulkReport>
where
    E: SqlExecutor,
    T: BulkRecord,
{
    if records.is_empty() && !delete_unmatched {
        return Ok(BulkReport::default());
    }

    let pairs = resolve_join_columns(descriptor, options.condition.as_ref())?;
    let inserted_columns =
        insert_columns(descriptor, &options.insert_columns, options.keep_identity)?;
    let assigned = update_columns(descriptor, &options.update_columns, &pairs)?;

    // Stage the union of both branches' columns, in ordinal order.
    let both: Vec<&ColumnSchema> = descriptor
        .column_schemas
        .iter()
        .filter(|cs| {
            inserted_columns.iter().any(|c| c.name == cs.name)
                || assigned.iter().any(|c| c.name == cs.name)
        })
        .collect();
    let staged = with_join_sources(descriptor, both, &pairs)?;
    let binding = RowBinding::bind(&staged)?;

    let generated = descriptor.generated_columns();
    let fetch_generated = options.fetch_generated && !generated.is_empty();

    // The output always carries the correlation id so actions can be attributed.
    let staging =
        clone_structure(executor, descriptor, &staged, true, options.staging_mode).await?;

    let outcome: BulkResult<BulkReport> = async {
        let mut map = CorrelationMap::new();
        load(
            executor,
            &staging,
            &staged,
            &binding,
            records,
            Some(&mut map),
            options.batch_size,
        )
        .await?;

        let statement = MergeStatement {
            descriptor,
            staging: &staging,
            insert_columns: Some(&inserted_columns),
            update_columns: Some(&assigned),
            join: &pairs,
            unconditional: false,
            delete_unmatched,
            keep_identity: options.keep_identity,
            returning: if fetch_generated { &generated } else { &[] },
            with_output: true,
        };
        let sql = statement.render();

        let rows = executor.query(&sql, &[]).await?;
        let parsed = parse_output_rows(&rows, if fetch_generated { &generated } else { &[] })?;

        if fetch_generated {
            write_back(records, &map, &generated, &parsed)?;
        }

        Ok(classify_output(&parsed))
    }
    .await;

    if !options.keep_staging_table {
        drop_staging(executor, &staging).await;
    }

    let report = outcome?;
    info!(
        table = %descriptor.name,
        inserted = report.rows_inserted,
        updated = report.rows_updated,
        deleted = report.rows_deleted,
        "bulk merge completed"
    );

    Ok(report)
}

fn bind_params(params: &[crate::types::Cell]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|cell| cell as &(dyn ToSql + Sync))
        .collect()
}

/// Deletes the rows a read query selects, without materializing them.
///
/// A filter that can never match short-circuits to zero without a round trip.
pub async fn run_delete_from_query<E: SqlExecutor>(
    executor: &E,
    query: &ReadQuery,
) -> BulkResult<u64> {
    let clauses = ClauseList::parse(&query.sql)?;
    if clauses.has_always_false_filter() {
        return Ok(0);
    }

    let sql = clauses.to_delete()?;
    let deleted = executor.execute(&sql, &bind_params(&query.params)).await?;

    info!(rows = deleted, "delete from query completed");

    Ok(deleted)
}

/// Applies a projection to the rows a read query selects, without materializing them.
pub async fn run_update_from_query<E: SqlExecutor>(
    executor: &E,
    query: &ReadQuery,
    projection: &Projection,
) -> BulkResult<u64> {
    let clauses = ClauseList::parse(&query.sql)?;
    if clauses.has_always_false_filter() {
        return Ok(0);
    }

    let mut params = query.params.clone();
    let sql = clauses.to_update(projection, &mut params)?;
    let updated = executor.execute(&sql, &bind_params(&params)).await?;

    info!(rows = updated, "update from query completed");

    Ok(updated)
}

/// Inserts the rows a read query selects into `target`, creating the target from the
/// query's shape when it does not exist yet.
///
/// The target is looked up in the catalogs to pick the statement shape. The
/// always-false short-circuit only applies to an existing target: a missing one
/// must still be created, empty.
pub async fn run_insert_from_query<E: SqlExecutor>(
    executor: &E,
    query: &ReadQuery,
    target: &TableName,
    columns: Option<&[String]>,
) -> BulkResult<u64> {
    let clauses = ClauseList::parse(&query.sql)?;
    let target_exists = table_exists(executor, target).await?;
    if target_exists && clauses.has_always_false_filter() {
        return Ok(0);
    }
    if !target_exists && !query.params.is_empty() {
        // CREATE TABLE AS is a utility statement and cannot be prepared with
        // bind parameters.
        bail!(
            ErrorKind::UnsupportedExpression,
            "Cannot create a table from a parameterized query",
            "inline the parameter values or create the target table first"
        );
    }

    let sql = clauses.to_insert_select(&target.as_quoted_identifier(), columns, target_exists)?;
    let inserted = executor.execute(&sql, &bind_params(&query.params)).await?;

    info!(table = %target, rows = inserted, "insert from query completed");

    Ok(inserted)
}

/// Counts the rows a read query selects, without materializing them.
pub async fn run_count_from_query<E: SqlExecutor>(
    executor: &E,
    query: &ReadQuery,
) -> BulkResult<u64> {
    let clauses = ClauseList::parse(&query.sql)?;
    if clauses.has_always_false_filter() {
        return Ok(0);
    }

    let sql = clauses.to_count()?;
    let rows = executor.query(&sql, &bind_params(&query.params)).await?;
    let Some(row) = rows.first() else {
        bail!(ErrorKind::InvalidState, "Count query returned no rows");
    };
    let count: i64 = row.try_get(0)?;

    Ok(count as u64)
}

/// A connection wrapper that runs each bulk operation in its own transaction.
///
/// The transaction commits when the operation succeeds and rolls back on drop when
/// it fails, so a partially applied operation never becomes visible.
pub struct BulkClient {
    client: Client,
    statement_timeout: Option<Duration>,
}

impl BulkClient {
    /// Connects to Postgres with the given connection string.
    pub async fn connect(config: &str) -> BulkResult<Self> {
        Ok(Self::new(connect(config).await?))
    }

    /// Wraps an existing connection.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            statement_timeout: None,
        }
    }

    /// Applies a per-statement timeout to every transaction this client opens.
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    /// Returns the underlying connection for ad-hoc statements.
    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn begin(&mut self, command_timeout: Option<Duration>) -> BulkResult<Transaction<'_>> {
        let transaction = self.client.transaction().await?;

        if let Some(timeout) = command_timeout.or(self.statement_timeout) {
            let set = format!("SET LOCAL statement_timeout = {}", timeout.as_millis());
            transaction.batch_execute(&set).await?;
        }

        Ok(transaction)
    }

    pub async fn bulk_insert<T: BulkRecord>(
        &mut self,
        descriptor: &TableDescriptor,
        records: &mut [T],
        options: &InsertOptions,
    ) -> BulkResult<BulkReport> {
        let transaction = self.begin(options.command_timeout).await?;
        let report = run_insert(&transaction, descriptor, records, options).await?;
        transaction.commit().await?;

        Ok(report)
    }

    pub async fn bulk_update<T: BulkRecord>(
        &mut self,
        descriptor: &TableDescriptor,
        records: &[T],
        options: &UpdateOptions,
    ) -> BulkResult<BulkReport> {
        let transaction = self.begin(options.command_timeout).await?;
        let report = run_update(&transaction, descriptor, records, options).await?;
        transaction.commit().await?;

        Ok(report)
    }

    pub async fn bulk_delete<T: BulkRecord>(
        &mut self,
        descriptor: &TableDescriptor,
        records: &[T],
        options: &DeleteOptions,
    ) -> BulkResult<BulkReport> {
        let transaction = self.begin(options.command_timeout).await?;
        let report = run_delete(&transaction, descriptor, records, options).await?;
        transaction.commit().await?;

        Ok(report)
    }

    /// Upserts records: matched rows are updated, unmatched records are inserted.
    pub async fn bulk_merge<T: BulkRecord>(
        &mut self,
        descriptor: &TableDescriptor,
        records: &mut [T],
        options: &MergeOptions,
    ) -> BulkResult<BulkReport> {
        let transaction = self.begin(options.command_timeout).await?;
        let report = run_merge(&transaction, descriptor, records, options, false).await?;
        transaction.commit().await?;

        Ok(report)
    }

    /// Synchronizes the destination to exactly the given records: upsert plus
    /// deletion of destination rows with no matching record.
    pub async fn bulk_sync<T: BulkRecord>(
        &mut self,
        descriptor: &TableDescriptor,
        records: &mut [T],
        options: &MergeOptions,
    ) -> BulkResult<BulkReport> {
        let transaction = self.begin(options.command_timeout).await?;
        let report = run_merge(&transaction, descriptor, records, options, true).await?;
        transaction.commit().await?;

        Ok(report)
    }

    pub async fn delete_from_query(&mut self, query: &ReadQuery) -> BulkResult<u64> {
        let transaction = self.begin(None).await?;
        let deleted = run_delete_from_query(&transaction, query).await?;
        transaction.commit().await?;

        Ok(deleted)
    }

    pub async fn update_from_query(
        &mut self,
        query: &ReadQuery,
        projection: &Projection,
    ) -> BulkResult<u64> {
        let transaction = self.begin(None).await?;
        let updated = run_update_from_query(&transaction, query, projection).await?;
        transaction.commit().await?;

        Ok(updated)
    }

    pub async fn insert_from_query(
        &mut self,
        query: &ReadQuery,
        target: &TableName,
        columns: Option<&[String]>,
    ) -> BulkResult<u64> {
        let transaction = self.begin(None).await?;
        let inserted = run_insert_from_query(&transaction, query, target, columns).await?;
        transaction.commit().await?;

        Ok(inserted)
    }

    pub async fn count_from_query(&mut self, query: &ReadQuery) -> BulkResult<u64> {
        run_count_from_query(&self.client, query).await
    }
}

/// Bulk operations over a caller-supplied transaction.
///
/// Nothing here commits or rolls back: the caller owns the transaction boundary and
/// can compose several bulk operations with its own statements atomically.
pub trait BulkOps: SqlExecutor + Sized {
    async fn bulk_insert<T: BulkRecord>(
        &self,
        descriptor: &TableDescriptor,
        records: &mut [T],
        options: &InsertOptions,
    ) -> BulkResult<BulkReport> {
        run_insert(self, descriptor, records, options).await
    }

    async fn bulk_update<T: BulkRecord>(
        &self,
        descriptor: &TableDescriptor,
        records: &[T],
        options: &UpdateOptions,
    ) -> BulkResult<BulkReport> {
        run_update(self, descriptor, records, options).await
    }

    async fn bulk_delete<T: BulkRecord>(
        &self,
        descriptor: &TableDescriptor,
        records: &[T],
        options: &DeleteOptions,
    ) -> BulkResult<BulkReport> {
        run_delete(self, descriptor, records, options).await
    }

    async fn bulk_merge<T: BulkRecord>(
        &self,
        descriptor: &TableDescriptor,
        records: &mut [T],
        options: &MergeOptions,
    ) -> BulkResult<BulkReport> {
        run_merge(self, descriptor, records, options, false).await
    }

    async fn bulk_sync<T: BulkRecord>(
        &self,
        descriptor: &TableDescriptor,
        records: &mut [T],
        options: &MergeOptions,
    ) -> BulkResult<BulkReport> {
        run_merge(self, descriptor, records, options, true).await
    }

    async fn delete_from_query(&self, query: &ReadQuery) -> BulkResult<u64> {
        run_delete_from_query(self, query).await
    }

    async fn update_from_query(
        &self,
        query: &ReadQuery,
        projection: &Projection,
    ) -> BulkResult<u64> {
        run_update_from_query(self, query, projection).await
    }

    async fn insert_from_query(
        &self,
        query: &ReadQuery,
        target: &TableName,
        columns: Option<&[String]>,
    ) -> BulkResult<u64> {
        run_insert_from_query(self, query, target, columns).await
    }

    async fn count_from_query(&self, query: &ReadQuery) -> BulkResult<u64> {
        run_count_from_query(self, query).await
    }
}

impl BulkOps for Transaction<'_> {}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use bytes::Bytes;
    use tokio_postgres::types::Type;
    use tokio_postgres::{CopyInSink, Row};

    use bulksync_postgres::types::FixedCondition;

    use super::*;

    /// Records every statement it receives and answers `execute` calls from a
    /// scripted queue of affected-row counts.
    struct ScriptedExecutor {
        statements: Mutex<Vec<String>>,
        execute_results: Mutex<VecDeque<u64>>,
    }

    impl ScriptedExecutor {
        fn new(execute_results: impl IntoIterator<Item = u64>) -> Self {
            Self {
                statements: Mutex::new(Vec::new()),
                execute_results: Mutex::new(execute_results.into_iter().collect()),
            }
        }

        fn statements(&self) -> Vec<String> {
            self.statements.lock().unwrap().clone()
        }
    }

    impl SqlExecutor for ScriptedExecutor {
        async fn execute(&self, sql: &str, _params: &[&(dyn ToSql + Sync)]) -> BulkResult<u64> {
            self.statements.lock().unwrap().push(sql.to_string());
            Ok(self.execute_results.lock().unwrap().pop_front().unwrap_or(0))
        }

        async fn query(&self, sql: &str, _params: &[&(dyn ToSql + Sync)]) -> BulkResult<Vec<Row>> {
            self.statements.lock().unwrap().push(sql.to_string());
            Ok(Vec::new())
        }

        async fn copy_in(&self, _sql: &str) -> BulkResult<CopyInSink<Bytes>> {
            bail!(ErrorKind::InvalidState, "COPY is not scripted");
        }

        async fn batch_execute(&self, sql: &str) -> BulkResult<()> {
            self.statements.lock().unwrap().push(sql.to_string());
            Ok(())
        }
    }

    fn create_test_descriptor() -> TableDescriptor {
        TableDescriptor::new(
            TableName::new("public".to_string(), "users".to_string()),
            vec![
                ColumnSchema::new("id".to_string(), Type::INT8, Some(1), false, true, false),
                ColumnSchema::new("name".to_string(), Type::TEXT, None, true, false, false),
                ColumnSchema::new("age".to_string(), Type::INT4, None, true, false, false),
                ColumnSchema::new("slug".to_string(), Type::TEXT, None, true, false, true),
            ],
        )
    }

    fn column_names(columns: &[&ColumnSchema]) -> Vec<String> {
        columns.iter().map(|cs| cs.name.clone()).collect()
    }

    #[test]
    fn test_insert_columns_exclude_generated_by_default() {
        let descriptor = create_test_descriptor();

        let columns =
            insert_columns(&descriptor, &ColumnSelection::All, false).unwrap();
        assert_eq!(column_names(&columns), vec!["name", "age"]);
    }

    #[test]
    fn test_insert_columns_keep_identity_includes_key() {
        let descriptor = create_test_descriptor();

        let columns = insert_columns(&descriptor, &ColumnSelection::All, true).unwrap();
        assert_eq!(column_names(&columns), vec!["id", "name", "age"]);
    }

    #[test]
    fn test_insert_columns_never_include_discriminators() {
        let descriptor = TableDescriptor::with_conditions(
            TableName::new("public".to_string(), "animals".to_string()),
            vec![
                ColumnSchema::new("id".to_string(), Type::INT8, Some(1), false, false, false),
                ColumnSchema::new("kind".to_string(), Type::TEXT, None, false, false, false),
            ],
            vec![FixedCondition::new("kind".to_string(), "dog".to_string())],
        );

        let columns = insert_columns(&descriptor, &ColumnSelection::All, false).unwrap();
        assert_eq!(column_names(&columns), vec!["id"]);
    }

    #[test]
    fn test_update_columns_exclude_join_targets() {
        let descriptor = create_test_descriptor();
        let pairs = vec![ColumnPair {
            source: "id".to_string(),
            target: "id".to_string(),
        }];

        let columns = update_columns(&descriptor, &ColumnSelection::All, &pairs).unwrap();
        assert_eq!(column_names(&columns), vec!["name", "age"]);
    }

    #[test]
    fn test_staged_columns_include_join_sources_in_ordinal_order() {
        let descriptor = create_test_descriptor();
        let pairs = vec![ColumnPair {
            source: "id".to_string(),
            target: "id".to_string(),
        }];
        let assigned = update_columns(&descriptor, &ColumnSelection::All, &pairs).unwrap();

        let staged = with_join_sources(&descriptor, assigned, &pairs).unwrap();
        assert_eq!(column_names(&staged), vec!["id", "name", "age"]);
    }

    #[test]
    fn test_no_assignable_columns_is_unsupported() {
        let descriptor = TableDescriptor::new(
            TableName::new("public".to_string(), "pairs".to_string()),
            vec![
                ColumnSchema::new("a".to_string(), Type::INT4, Some(1), false, false, false),
                ColumnSchema::new("b".to_string(), Type::INT4, Some(2), false, false, false),
            ],
        );
        let pairs = vec![
            ColumnPair {
                source: "a".to_string(),
                target: "a".to_string(),
            },
            ColumnPair {
                source: "b".to_string(),
                target: "b".to_string(),
            },
        ];

        let err = update_columns(&descriptor, &ColumnSelection::All, &pairs).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedExpression);
    }

    #[test]
    fn test_write_back_targets_originating_records() {
        let descriptor = create_test_descriptor();
        let id_column = descriptor.column("id").unwrap();
        let generated = vec![id_column];

        let mut records = vec![
            serde_json::json!({"name": "ada"}),
            serde_json::json!({"name": "bob"}),
        ];
        let mut map = CorrelationMap::new();
        map.next_id();
        map.next_id();

        let rows = vec![
            crate::merge::OutputRow {
                action: MergeAction::Insert,
                correlation_id: Some(2),
                generated: vec![crate::types::Cell::I64(42)],
            },
            crate::merge::OutputRow {
                action: MergeAction::Insert,
                correlation_id: Some(1),
                generated: vec![crate::types::Cell::I64(41)],
            },
        ];

        write_back(&mut records, &map, &generated, &rows).unwrap();

        assert_eq!(records[0]["id"], serde_json::json!(41));
        assert_eq!(records[1]["id"], serde_json::json!(42));
    }

    #[test]
    fn test_classify_output_tallies_every_action_once() {
        let row = |action, correlation_id| OutputRow {
            action,
            correlation_id,
            generated: Vec::new(),
        };
        let rows = vec![
            row(MergeAction::Insert, Some(1)),
            row(MergeAction::Update, Some(2)),
            row(MergeAction::Insert, Some(3)),
            row(MergeAction::Delete, None),
        ];

        let report = classify_output(&rows);

        assert_eq!(report.rows_affected, 4);
        assert_eq!(report.rows_inserted, 2);
        assert_eq!(report.rows_updated, 1);
        assert_eq!(report.rows_deleted, 1);
        assert_eq!(
            report.rows_inserted + report.rows_updated + report.rows_deleted,
            report.rows_affected
        );
        assert_eq!(
            report.actions,
            vec![
                MergeAction::Insert,
                MergeAction::Update,
                MergeAction::Insert,
                MergeAction::Delete
            ]
        );
    }

    #[tokio::test]
    async fn test_insert_from_query_creates_missing_target() {
        // The catalog lookup finds nothing, then the create runs.
        let executor = ScriptedExecutor::new([0, 5]);
        let query = ReadQuery::new("SELECT id, name FROM public.source");
        let target = TableName::new("public".to_string(), "dest".to_string());

        let inserted = run_insert_from_query(&executor, &query, &target, None)
            .await
            .unwrap();

        assert_eq!(inserted, 5);
        let statements = executor.statements();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("pg_class"));
        assert!(statements[1].starts_with("CREATE TABLE \"public\".\"dest\" AS"));
    }

    #[tokio::test]
    async fn test_insert_from_query_inserts_into_existing_target() {
        let executor = ScriptedExecutor::new([1, 3]);
        let query = ReadQuery::new("SELECT id, name FROM public.source");
        let target = TableName::new("public".to_string(), "dest".to_string());

        let inserted = run_insert_from_query(&executor, &query, &target, None)
            .await
            .unwrap();

        assert_eq!(inserted, 3);
        let statements = executor.statements();
        assert_eq!(statements.len(), 2);
        assert!(statements[1].starts_with("INSERT INTO \"public\".\"dest\""));
    }

    #[tokio::test]
    async fn test_insert_from_query_short_circuits_always_false_filter() {
        let executor = ScriptedExecutor::new([1]);
        let query = ReadQuery::new("SELECT id FROM public.source WHERE 1 = 0");
        let target = TableName::new("public".to_string(), "dest".to_string());

        let inserted = run_insert_from_query(&executor, &query, &target, None)
            .await
            .unwrap();

        // Only the catalog lookup reaches the database.
        assert_eq!(inserted, 0);
        assert_eq!(executor.statements().len(), 1);
    }

    #[tokio::test]
    async fn test_insert_from_query_rejects_parameterized_create() {
        let executor = ScriptedExecutor::new([0]);
        let query = ReadQuery::new("SELECT id FROM public.source WHERE id > $1").bind(10i64);
        let target = TableName::new("public".to_string(), "dest".to_string());

        let err = run_insert_from_query(&executor, &query, &target, None)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UnsupportedExpression);
    }
}
