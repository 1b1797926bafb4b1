//! Set-based bulk operations for Postgres.
//!
//! Collections of records are streamed into a transient staging table with binary
//! COPY and applied to the destination with a single set-based statement: MERGE for
//! inserts and upserts, join-based UPDATE and DELETE for the rest. Read queries can
//! be rewritten in place into DELETE, UPDATE, or INSERT ... SELECT statements so the
//! selected rows are never materialized on the client.
//!
//! [`BulkClient`] runs each operation in its own transaction; [`BulkOps`] exposes the
//! same operations on a caller-supplied [`tokio_postgres::Transaction`]. A blocking
//! facade lives in [`blocking`].

pub mod blocking;
pub mod error;
pub mod executor;
pub mod expr;
mod macros;
pub mod merge;
pub mod ops;
pub mod query;
pub mod rewrite;
pub mod schema;
pub mod staging;
pub mod stream;
pub mod types;

pub use error::{BulkError, BulkResult, ErrorKind};
pub use executor::{SqlExecutor, connect};
pub use expr::{ColumnRef, JoinCondition, JoinExpr, Projection, SqlExpr};
pub use merge::MergeAction;
pub use ops::{
    BulkClient, BulkOps, BulkReport, DeleteOptions, InsertOptions, MergeOptions, UpdateOptions,
};
pub use query::ReadQuery;
pub use schema::{fetch_table_descriptor, table_exists};
pub use staging::StagingMode;
pub use stream::{BulkRecord, ColumnSelection};
pub use types::{Cell, ColumnSchema, TableDescriptor, TableName, TableRow};
