//! Common types used throughout the bulk engine.
//!
//! Re-exports the cell value model, table rows, and the Postgres schema types so
//! callers only need one import path.

mod cell;
mod table_row;

pub use cell::*;
pub use table_row::*;

// Re-exports.
pub use bulksync_postgres::types::*;
pub use tokio_postgres::types::Type;
