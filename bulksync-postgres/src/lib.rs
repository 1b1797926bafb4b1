//! Postgres-facing schema types shared by the bulksync engine.
//!
//! Contains the immutable table descriptor consumed by every bulk operation:
//! qualified table names, column schemas with identity/computed flags, and fixed
//! discriminator conditions used by single-table-per-hierarchy mappings.

pub mod types;
