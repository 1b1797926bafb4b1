//! Statically renderable expressions: update projections and join conditions.
//!
//! Set-based statements have no per-row evaluation context, so everything here must
//! be renderable to SQL up front. Anything that would need the pre-update row value
//! is rejected with [`ErrorKind::UnsupportedExpression`].

use bulksync_postgres::types::TableDescriptor;

use crate::bail;
use crate::error::{BulkResult, ErrorKind};
use crate::types::Cell;

/// A scalar expression assignable to a column in an UPDATE projection.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlExpr {
    /// A literal value, rendered as a bind parameter.
    Literal(Cell),
    /// Raw SQL text, rendered verbatim (e.g. `now()`).
    Raw(String),
    /// A reference to the row's own pre-update column value.
    ///
    /// Not renderable in a set-based rewrite; always rejected.
    Column(String),
}

/// An ordered list of `column = expression` assignments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Projection {
    pub assignments: Vec<(String, SqlExpr)>,
}

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an assignment to the projection.
    pub fn set(mut self, column: impl Into<String>, expr: SqlExpr) -> Self {
        self.assignments.push((column.into(), expr));
        self
    }
}

/// Which side of the staging/destination join a column reference belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinSide {
    /// The staging (source) table.
    Source,
    /// The destination (target) table.
    Target,
}

/// A column reference attributed to one join side.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub side: JoinSide,
    pub column: String,
}

impl ColumnRef {
    pub fn source(column: impl Into<String>) -> Self {
        Self {
            side: JoinSide::Source,
            column: column.into(),
        }
    }

    pub fn target(column: impl Into<String>) -> Self {
        Self {
            side: JoinSide::Target,
            column: column.into(),
        }
    }
}

/// A custom equality join predicate.
///
/// Deliberately restricted to AND-joined column equalities: more complex predicates
/// (OR conditions, computed expressions) are unsupported rather than guessed at.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinExpr {
    Eq(ColumnRef, ColumnRef),
    And(Box<JoinExpr>, Box<JoinExpr>),
}

impl JoinExpr {
    pub fn eq(left: ColumnRef, right: ColumnRef) -> Self {
        JoinExpr::Eq(left, right)
    }

    pub fn and(self, other: JoinExpr) -> Self {
        JoinExpr::And(Box::new(self), Box::new(other))
    }
}

/// How an operation joins staging rows to destination rows.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinCondition {
    /// Equality on the named columns, same name on both sides.
    Columns(Vec<String>),
    /// A custom equality expression, decomposed into column pairs.
    Expr(JoinExpr),
}

/// One decomposed equality: a staging column matched against a destination column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnPair {
    pub source: String,
    pub target: String,
}

/// Decomposes a custom join expression into column-pair equalities.
///
/// Each equality must compare exactly one source-side column with one target-side
/// column; the pair is normalized so the staging column always lands on the source
/// side regardless of how the comparison was written.
pub fn decompose(expr: &JoinExpr) -> BulkResult<Vec<ColumnPair>> {
    match expr {
        JoinExpr::Eq(left, right) => match (left.side, right.side) {
            (JoinSide::Source, JoinSide::Target) => Ok(vec![ColumnPair {
                source: left.column.clone(),
                target: right.column.clone(),
            }]),
            (JoinSide::Target, JoinSide::Source) => Ok(vec![ColumnPair {
                source: right.column.clone(),
                target: left.column.clone(),
            }]),
            _ => bail!(
                ErrorKind::UnsupportedExpression,
                "Join equality must compare a source column with a target column",
                format!(
                    "'{}' and '{}' are attributed to the same side",
                    left.column, right.column
                )
            ),
        },
        JoinExpr::And(left, right) => {
            let mut pairs = decompose(left)?;
            pairs.extend(decompose(right)?);
            Ok(pairs)
        }
    }
}

/// Resolves the effective join columns for an operation.
///
/// A custom condition wins when supplied; otherwise the join defaults to the primary
/// key. Having neither is a fatal precondition failure, checked before any staging
/// table is created.
pub fn resolve_join_columns(
    descriptor: &TableDescriptor,
    condition: Option<&JoinCondition>,
) -> BulkResult<Vec<ColumnPair>> {
    let pairs = match condition {
        Some(JoinCondition::Columns(names)) => {
            if names.is_empty() {
                bail!(
                    ErrorKind::UnsupportedExpression,
                    "Join condition names no columns"
                );
            }

            names
                .iter()
                .map(|name| ColumnPair {
                    source: name.clone(),
                    target: name.clone(),
                })
                .collect()
        }
        Some(JoinCondition::Expr(expr)) => decompose(expr)?,
        None => descriptor
            .primary_key_columns()
            .iter()
            .map(|cs| ColumnPair {
                source: cs.name.clone(),
                target: cs.name.clone(),
            })
            .collect(),
    };

    if pairs.is_empty() {
        bail!(
            ErrorKind::MissingKey,
            "Table has no primary key and no explicit condition was supplied",
            format!("table '{}'", descriptor.name)
        );
    }

    for pair in &pairs {
        descriptor.require_column(&pair.target)?;
    }

    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulksync_postgres::types::{ColumnSchema, TableName};
    use tokio_postgres::types::Type;

    fn keyless_descriptor() -> TableDescriptor {
        TableDescriptor::new(
            TableName::new("public".to_string(), "events".to_string()),
            vec![ColumnSchema::new(
                "payload".to_string(),
                Type::TEXT,
                None,
                true,
                false,
                false,
            )],
        )
    }

    fn keyed_descriptor() -> TableDescriptor {
        TableDescriptor::new(
            TableName::new("public".to_string(), "users".to_string()),
            vec![
                ColumnSchema::new("id".to_string(), Type::INT8, Some(1), false, true, false),
                ColumnSchema::new("email".to_string(), Type::TEXT, None, false, false, false),
            ],
        )
    }

    #[test]
    fn test_decompose_normalizes_sides() {
        let expr = JoinExpr::eq(ColumnRef::target("id"), ColumnRef::source("user_id"))
            .and(JoinExpr::eq(ColumnRef::source("email"), ColumnRef::target("email")));

        let pairs = decompose(&expr).unwrap();

        assert_eq!(
            pairs,
            vec![
                ColumnPair {
                    source: "user_id".to_string(),
                    target: "id".to_string()
                },
                ColumnPair {
                    source: "email".to_string(),
                    target: "email".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_decompose_same_side_comparison_is_unsupported() {
        let expr = JoinExpr::eq(ColumnRef::source("a"), ColumnRef::source("b"));

        let err = decompose(&expr).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedExpression);
    }

    #[test]
    fn test_resolve_defaults_to_primary_key() {
        let descriptor = keyed_descriptor();

        let pairs = resolve_join_columns(&descriptor, None).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].target, "id");
    }

    #[test]
    fn test_resolve_without_key_or_condition_is_missing_key() {
        let descriptor = keyless_descriptor();

        let err = resolve_join_columns(&descriptor, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingKey);
    }

    #[test]
    fn test_resolve_custom_columns_validated_against_descriptor() {
        let descriptor = keyed_descriptor();
        let condition = JoinCondition::Columns(vec!["missing".to_string()]);

        let err = resolve_join_columns(&descriptor, Some(&condition)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaError);
    }
}
