//! The statement execution seam between the engine and tokio-postgres.
//!
//! Bulk operations are written against [`SqlExecutor`] so the same code path runs
//! inside an operation-owned transaction or inside a caller-supplied one.

use std::future::Future;

use bytes::Bytes;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, CopyInSink, NoTls, Row, Transaction};
use tracing::{error, info};

use crate::error::BulkResult;

/// Abstraction over the statement-level operations bulk processing needs.
///
/// Implemented for [`Client`] and [`Transaction`] so core operations are transparent
/// to whether they own the surrounding transaction.
pub trait SqlExecutor: Sync {
    /// Executes a statement, returning the number of rows affected.
    fn execute(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> impl Future<Output = BulkResult<u64>> + Send;

    /// Executes a statement, returning its result rows.
    fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> impl Future<Output = BulkResult<Vec<Row>>> + Send;

    /// Opens a COPY FROM STDIN sink for the given statement.
    fn copy_in(&self, sql: &str) -> impl Future<Output = BulkResult<CopyInSink<Bytes>>> + Send;

    /// Executes a sequence of statements separated by semicolons.
    fn batch_execute(&self, sql: &str) -> impl Future<Output = BulkResult<()>> + Send;
}

impl SqlExecutor for Client {
    async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> BulkResult<u64> {
        Ok(Client::execute(self, sql, params).await?)
    }

    async fn query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> BulkResult<Vec<Row>> {
        Ok(Client::query(self, sql, params).await?)
    }

    async fn copy_in(&self, sql: &str) -> BulkResult<CopyInSink<Bytes>> {
        Ok(Client::copy_in(self, sql).await?)
    }

    async fn batch_execute(&self, sql: &str) -> BulkResult<()> {
        Ok(Client::batch_execute(self, sql).await?)
    }
}

impl SqlExecutor for Transaction<'_> {
    async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> BulkResult<u64> {
        Ok(Transaction::execute(self, sql, params).await?)
    }

    async fn query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> BulkResult<Vec<Row>> {
        Ok(Transaction::query(self, sql, params).await?)
    }

    async fn copy_in(&self, sql: &str) -> BulkResult<CopyInSink<Bytes>> {
        Ok(Transaction::copy_in(self, sql).await?)
    }

    async fn batch_execute(&self, sql: &str) -> BulkResult<()> {
        Ok(Transaction::batch_execute(self, sql).await?)
    }
}

/// Connects to Postgres and spawns a background task that drives the connection
/// until it terminates.
///
/// There is no need to track the connection task via its `JoinHandle` since the
/// returned `Client` will terminate the connection when dropped.
pub async fn connect(config: &str) -> BulkResult<Client> {
    let (client, connection) = tokio_postgres::connect(config, NoTls).await?;

    tokio::spawn(async move {
        match connection.await {
            Err(err) => error!("an error occurred during the postgres connection: {}", err),
            Ok(()) => info!("postgres connection terminated successfully"),
        }
    });

    Ok(client)
}
