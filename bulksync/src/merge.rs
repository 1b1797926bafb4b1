//! Builders for the set-based statements that consume a staging table: MERGE for
//! insert and upsert shapes, join-based UPDATE and DELETE for the rest.
//!
//! All statements alias the destination as `t` and the staging table as `s`.
//! Generated-column write-back rides on the statement's RETURNING list together with
//! the correlation id, so affected rows map back to the records that produced them.

use pg_escape::{quote_identifier, quote_literal};
use tokio_postgres::Row;

use bulksync_postgres::types::{ColumnSchema, TableDescriptor};

use crate::bail;
use crate::error::{BulkResult, ErrorKind};
use crate::expr::ColumnPair;
use crate::staging::{CORRELATION_COLUMN, StagingTable};
use crate::types::Cell;

pub const TARGET_ALIAS: &str = "t";
pub const SOURCE_ALIAS: &str = "s";

/// The action MERGE reports for an output row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    Insert,
    Update,
    Delete,
}

impl MergeAction {
    /// Parses the value of `merge_action()`.
    pub fn parse(text: &str) -> BulkResult<MergeAction> {
        match text {
            "INSERT" => Ok(MergeAction::Insert),
            "UPDATE" => Ok(MergeAction::Update),
            "DELETE" => Ok(MergeAction::Delete),
            other => bail!(
                ErrorKind::InvalidState,
                "Unrecognized merge action in statement output",
                format!("got '{other}'")
            ),
        }
    }
}

fn qualified(alias: &str, column: &str) -> String {
    format!("{alias}.{}", quote_identifier(column))
}

/// Renders the ON predicate joining staging rows to destination rows, with any
/// fixed discriminator conditions appended on the target side.
fn join_predicate(descriptor: &TableDescriptor, pairs: &[ColumnPair]) -> String {
    let mut terms: Vec<String> = pairs
        .iter()
        .map(|pair| {
            format!(
                "{} = {}",
                qualified(TARGET_ALIAS, &pair.target),
                qualified(SOURCE_ALIAS, &pair.source)
            )
        })
        .collect();

    for condition in &descriptor.conditions {
        terms.push(format!(
            "{} = {}",
            qualified(TARGET_ALIAS, &condition.column),
            quote_literal(&condition.value)
        ));
    }

    terms.join(" AND ")
}

/// The shape of a MERGE statement over a loaded staging table.
///
/// An unconditional statement joins on a contradiction so every staging row takes the
/// not-matched branch; that is how plain inserts reuse the MERGE machinery and its
/// RETURNING support.
pub struct MergeStatement<'a> {
    pub descriptor: &'a TableDescriptor,
    pub staging: &'a StagingTable,
    /// Columns inserted by the not-matched branch, in staging order. `None` omits
    /// the branch entirely.
    pub insert_columns: Option<&'a [&'a ColumnSchema]>,
    /// Columns assigned by the matched branch. `None` omits the branch.
    pub update_columns: Option<&'a [&'a ColumnSchema]>,
    pub join: &'a [ColumnPair],
    /// Join on a contradiction instead of the key columns.
    pub unconditional: bool,
    /// Adds `WHEN NOT MATCHED BY SOURCE THEN DELETE` for full synchronization,
    /// gated on the descriptor's fixed conditions so only the matching slice is
    /// pruned.
    pub delete_unmatched: bool,
    /// Inserts explicit values into identity columns instead of drawing from the
    /// sequence.
    pub keep_identity: bool,
    /// Generated columns returned from the target for write-back. When non-empty
    /// the statement also returns the action tag and the correlation id.
    pub returning: &'a [&'a ColumnSchema],
    /// Return the action tag and correlation id even without generated columns.
    pub with_output: bool,
}

impl MergeStatement<'_> {
    pub fn render(&self) -> String {
        let predicate = if self.unconditional {
            "1 = 2".to_string()
        } else {
            join_predicate(self.descriptor, self.join)
        };

        let mut sql = format!(
            "MERGE INTO {} AS {} USING {} AS {} ON {}",
            self.descriptor.name.as_quoted_identifier(),
            TARGET_ALIAS,
            self.staging.quoted_name(),
            SOURCE_ALIAS,
            predicate,
        );

        if let Some(columns) = self.update_columns {
            let assignments = columns
                .iter()
                .map(|cs| {
                    format!(
                        "{} = {}",
                        quote_identifier(&cs.name),
                        qualified(SOURCE_ALIAS, &cs.name)
                    )
                })
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" WHEN MATCHED THEN UPDATE SET {assignments}"));
        }

        if let Some(columns) = self.insert_columns {
            let mut names: Vec<String> = columns
                .iter()
                .map(|cs| quote_identifier(&cs.name).to_string())
                .collect();
            let mut values: Vec<String> = columns
                .iter()
                .map(|cs| qualified(SOURCE_ALIAS, &cs.name))
                .collect();

            // Discriminator columns are pinned, never streamed.
            for condition in &self.descriptor.conditions {
                names.push(quote_identifier(&condition.column).to_string());
                values.push(quote_literal(&condition.value).to_string());
            }

            let overriding = if self.keep_identity {
                " OVERRIDING SYSTEM VALUE"
            } else {
                ""
            };
            sql.push_str(&format!(
                " WHEN NOT MATCHED THEN INSERT ({}){} VALUES ({})",
                names.join(", "),
                overriding,
                values.join(", ")
            ));
        }

        if self.delete_unmatched {
            // The ON predicate filters other discriminator slices out of the match,
            // which would land them in NOT MATCHED BY SOURCE; gate the delete branch
            // on the same conditions so a sync only prunes its own slice.
            sql.push_str(" WHEN NOT MATCHED BY SOURCE");
            for condition in &self.descriptor.conditions {
                sql.push_str(&format!(
                    " AND {} = {}",
                    qualified(TARGET_ALIAS, &condition.column),
                    quote_literal(&condition.value)
                ));
            }
            sql.push_str(" THEN DELETE");
        }

        if self.with_output || !self.returning.is_empty() {
            let mut outputs = vec![
                "merge_action() AS _action".to_string(),
                format!(
                    "{} AS {}",
                    qualified(SOURCE_ALIAS, CORRELATION_COLUMN),
                    quote_identifier(CORRELATION_COLUMN)
                ),
            ];
            for cs in self.returning {
                outputs.push(format!(
                    "{} AS {}",
                    qualified(TARGET_ALIAS, &cs.name),
                    quote_identifier(&cs.name)
                ));
            }
            sql.push_str(&format!(" RETURNING {}", outputs.join(", ")));
        }

        sql
    }
}

/// Builds a join-based UPDATE assigning the staged columns to matching rows.
pub fn build_update_join(
    descriptor: &TableDescriptor,
    staging: &StagingTable,
    update_columns: &[&ColumnSchema],
    pairs: &[ColumnPair],
) -> String {
    let assignments = update_columns
        .iter()
        .map(|cs| {
            format!(
                "{} = {}",
                quote_identifier(&cs.name),
                qualified(SOURCE_ALIAS, &cs.name)
            )
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "UPDATE {} AS {} SET {} FROM {} AS {} WHERE {}",
        descriptor.name.as_quoted_identifier(),
        TARGET_ALIAS,
        assignments,
        staging.quoted_name(),
        SOURCE_ALIAS,
        join_predicate(descriptor, pairs),
    )
}

/// Builds a join-based DELETE removing rows matched by the staging table.
pub fn build_delete_join(
    descriptor: &TableDescriptor,
    staging: &StagingTable,
    pairs: &[ColumnPair],
) -> String {
    format!(
        "DELETE FROM {} AS {} USING {} AS {} WHERE {}",
        descriptor.name.as_quoted_identifier(),
        TARGET_ALIAS,
        staging.quoted_name(),
        SOURCE_ALIAS,
        join_predicate(descriptor, pairs),
    )
}

/// One parsed output row of a MERGE with RETURNING.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRow {
    pub action: MergeAction,
    /// The correlation id of the staging row, absent for delete actions where no
    /// staging row matched.
    pub correlation_id: Option<i64>,
    /// Generated column values from the target, in requested order.
    pub generated: Vec<Cell>,
}

/// Parses MERGE output rows shaped by [`MergeStatement::render`]: action tag,
/// correlation id, then the requested generated columns.
pub fn parse_output_rows(
    rows: &[Row],
    generated: &[&ColumnSchema],
) -> BulkResult<Vec<OutputRow>> {
    let mut parsed = Vec::with_capacity(rows.len());

    for row in rows {
        let action_text: String = row.try_get("_action")?;
        let correlation_id: Option<i64> = row.try_get(CORRELATION_COLUMN)?;

        let mut values = Vec::with_capacity(generated.len());
        for (idx, _) in generated.iter().enumerate() {
            values.push(Cell::from_row(row, idx + 2)?);
        }

        parsed.push(OutputRow {
            action: MergeAction::parse(&action_text)?,
            correlation_id,
            generated: values,
        });
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::StagingMode;
    use bulksync_postgres::types::{FixedCondition, TableName};
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

    fn create_test_staging() -> StagingTable {
        StagingTable {
            name: TableName::new("public".to_string(), "users_staging_0a1b2c3d".to_string()),
            mode: StagingMode::Temporary,
            correlation: true,
        }
    }

    #[test]
    fn test_unconditional_insert_merge() {
        let descriptor = create_test_descriptor();
        let staging = create_test_staging();
        let name = descriptor.column("name").unwrap();
        let age = descriptor.column("age").unwrap();
        let id = descriptor.column("id").unwrap();
        let insert_columns = [name, age];
        let returning = [id];

        let sql = MergeStatement {
            descriptor: &descriptor,
            staging: &staging,
            insert_columns: Some(&insert_columns),
            update_columns: None,
            join: &[],
            unconditional: true,
            delete_unmatched: false,
            keep_identity: false,
            returning: &returning,
            with_output: true,
        }
        .render();

        assert_eq!(
            sql,
            "MERGE INTO public.users AS t USING users_staging_0a1b2c3d AS s ON 1 = 2 \
             WHEN NOT MATCHED THEN INSERT (name, age) VALUES (s.name, s.age) \
             RETURNING merge_action() AS _action, s._staging_row_id AS _staging_row_id, t.id AS id"
        );
    }

    #[test]
    fn test_upsert_merge_with_sync_delete() {
        let descriptor = create_test_descriptor();
        let staging = create_test_staging();
        let id = descriptor.column("id").unwrap();
        let name = descriptor.column("name").unwrap();
        let age = descriptor.column("age").unwrap();
        let insert_columns = [id, name, age];
        let update_columns = [name, age];
        let join = [ColumnPair {
            source: "id".to_string(),
            target: "id".to_string(),
        }];

        let sql = MergeStatement {
            descriptor: &descriptor,
            staging: &staging,
            insert_columns: Some(&insert_columns),
            update_columns: Some(&update_columns),
            join: &join,
            unconditional: false,
            delete_unmatched: true,
            keep_identity: true,
            returning: &[],
            with_output: true,
        }
        .render();

        assert_eq!(
            sql,
            "MERGE INTO public.users AS t USING users_staging_0a1b2c3d AS s ON t.id = s.id \
             WHEN MATCHED THEN UPDATE SET name = s.name, age = s.age \
             WHEN NOT MATCHED THEN INSERT (id, name, age) OVERRIDING SYSTEM VALUE VALUES (s.id, s.name, s.age) \
             WHEN NOT MATCHED BY SOURCE THEN DELETE \
             RETURNING merge_action() AS _action, s._staging_row_id AS _staging_row_id"
        );
    }

    #[test]
    fn test_sync_delete_is_gated_by_fixed_conditions() {
        let descriptor = TableDescriptor::with_conditions(
            TableName::new("public".to_string(), "animals".to_string()),
            vec![
                ColumnSchema::new("id".to_string(), Type::INT8, Some(1), false, false, false),
                ColumnSchema::new("name".to_string(), Type::TEXT, None, true, false, false),
                ColumnSchema::new("kind".to_string(), Type::TEXT, None, false, false, false),
            ],
            vec![FixedCondition::new("kind".to_string(), "dog".to_string())],
        );
        let staging = StagingTable {
            name: TableName::new("public".to_string(), "animals_staging_0a1b2c3d".to_string()),
            mode: StagingMode::Temporary,
            correlation: true,
        };
        let id = descriptor.column("id").unwrap();
        let name = descriptor.column("name").unwrap();
        let insert_columns = [id, name];
        let update_columns = [name];
        let join = [ColumnPair {
            source: "id".to_string(),
            target: "id".to_string(),
        }];

        let sql = MergeStatement {
            descriptor: &descriptor,
            staging: &staging,
            insert_columns: Some(&insert_columns),
            update_columns: Some(&update_columns),
            join: &join,
            unconditional: false,
            delete_unmatched: true,
            keep_identity: false,
            returning: &[],
            with_output: true,
        }
        .render();

        // Rows of other discriminator slices fail the ON match and must not be
        // swept up by the delete branch.
        assert!(sql.contains("WHEN NOT MATCHED BY SOURCE AND t.kind = 'dog' THEN DELETE"));
    }

    #[test]
    fn test_fixed_conditions_pin_inserts_and_filter_joins() {
        let descriptor = TableDescriptor::with_conditions(
            TableName::new("public".to_string(), "animals".to_string()),
            vec![
                ColumnSchema::new("id".to_string(), Type::INT8, Some(1), false, false, false),
                ColumnSchema::new("name".to_string(), Type::TEXT, None, true, false, false),
                ColumnSchema::new("kind".to_string(), Type::TEXT, None, false, false, false),
            ],
            vec![FixedCondition::new("kind".to_string(), "dog".to_string())],
        );
        let staging = StagingTable {
            name: TableName::new("public".to_string(), "animals_staging_0a1b2c3d".to_string()),
            mode: StagingMode::Temporary,
            correlation: false,
        };
        let id = descriptor.column("id").unwrap();
        let name = descriptor.column("name").unwrap();
        let insert_columns = [id, name];
        let update_columns = [name];
        let join = [ColumnPair {
            source: "id".to_string(),
            target: "id".to_string(),
        }];

        let sql = MergeStatement {
            descriptor: &descriptor,
            staging: &staging,
            insert_columns: Some(&insert_columns),
            update_columns: Some(&update_columns),
            join: &join,
            unconditional: false,
            delete_unmatched: false,
            keep_identity: false,
            returning: &[],
            with_output: false,
        }
        .render();

        assert_eq!(
            sql,
            "MERGE INTO public.animals AS t USING animals_staging_0a1b2c3d AS s \
             ON t.id = s.id AND t.kind = 'dog' \
             WHEN MATCHED THEN UPDATE SET name = s.name \
             WHEN NOT MATCHED THEN INSERT (id, name, kind) VALUES (s.id, s.name, 'dog')"
        );
    }

    #[test]
    fn test_join_update_and_delete_statements() {
        let descriptor = create_test_descriptor();
        let staging = create_test_staging();
        let name = descriptor.column("name").unwrap();
        let update_columns = [name];
        let pairs = [ColumnPair {
            source: "id".to_string(),
            target: "id".to_string(),
        }];

        assert_eq!(
            build_update_join(&descriptor, &staging, &update_columns, &pairs),
            "UPDATE public.users AS t SET name = s.name \
             FROM users_staging_0a1b2c3d AS s WHERE t.id = s.id"
        );
        assert_eq!(
            build_delete_join(&descriptor, &staging, &pairs),
            "DELETE FROM public.users AS t USING users_staging_0a1b2c3d AS s WHERE t.id = s.id"
        );
    }

    #[test]
    fn test_parse_merge_action() {
        assert_eq!(MergeAction::parse("INSERT").unwrap(), MergeAction::Insert);
        assert_eq!(MergeAction::parse("UPDATE").unwrap(), MergeAction::Update);
        assert_eq!(MergeAction::parse("DELETE").unwrap(), MergeAction::Delete);
        assert!(MergeAction::parse("TRUNCATE").is_err());
    }
}
