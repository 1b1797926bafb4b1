//! A blocking facade over [`BulkClient`] for callers without an async runtime.
//!
//! Owns a single-threaded runtime and drives the async client to completion on the
//! calling thread. Must not be used from inside an async context.

use std::time::Duration;

use tokio::runtime::{Builder, Runtime};

use bulksync_postgres::types::{TableDescriptor, TableName};

use crate::error::BulkResult;
use crate::expr::Projection;
use crate::ops::{
    BulkClient, BulkReport, DeleteOptions, InsertOptions, MergeOptions, UpdateOptions,
};
use crate::query::ReadQuery;
use crate::stream::BulkRecord;

pub struct BlockingBulkClient {
    runtime: Runtime,
    inner: BulkClient,
}

impl BlockingBulkClient {
    /// Connects to Postgres, driving the connection from an owned runtime.
    pub fn connect(config: &str) -> BulkResult<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let inner = runtime.block_on(BulkClient::connect(config))?;

        Ok(Self { runtime, inner })
    }

    /// Applies a per-statement timeout to every transaction this client opens.
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.inner = self.inner.with_statement_timeout(timeout);
        self
    }

    pub fn bulk_insert<T: BulkRecord>(
        &mut self,
        descriptor: &TableDescriptor,
        records: &mut [T],
        options: &InsertOptions,
    ) -> BulkResult<BulkReport> {
        self.runtime
            .block_on(self.inner.bulk_insert(descriptor, records, options))
    }

    pub fn bulk_update<T: BulkRecord>(
        &mut self,
        descriptor: &TableDescriptor,
        records: &[T],
        options: &UpdateOptions,
    ) -> BulkResult<BulkReport> {
        self.runtime
            .block_on(self.inner.bulk_update(descriptor, records, options))
    }

    pub fn bulk_delete<T: BulkRecord>(
        &mut self,
        descriptor: &TableDescriptor,
        records: &[T],
        options: &DeleteOptions,
    ) -> BulkResult<BulkReport> {
        self.runtime
            .block_on(self.inner.bulk_delete(descriptor, records, options))
    }

    pub fn bulk_merge<T: BulkRecord>(
        &mut self,
        descriptor: &TableDescriptor,
        records: &mut [T],
        options: &MergeOptions,
    ) -> BulkResult<BulkReport> {
        self.runtime
            .block_on(self.inner.bulk_merge(descriptor, records, options))
    }

    pub fn bulk_sync<T: BulkRecord>(
        &mut self,
        descriptor: &TableDescriptor,
        records: &mut [T],
        options: &MergeOptions,
    ) -> BulkResult<BulkReport> {
        self.runtime
            .block_on(self.inner.bulk_sync(descriptor, records, options))
    }

    pub fn delete_from_query(&mut self, query: &ReadQuery) -> BulkResult<u64> {
        self.runtime.block_on(self.inner.delete_from_query(query))
    }

    pub fn update_from_query(
        &mut self,
        query: &ReadQuery,
        projection: &Projection,
    ) -> BulkResult<u64> {
        self.runtime
            .block_on(self.inner.update_from_query(query, projection))
    }

    pub fn insert_from_query(
        &mut self,
        query: &ReadQuery,
        target: &TableName,
        columns: Option<&[String]>,
    ) -> BulkResult<u64> {
        self.runtime
            .block_on(self.inner.insert_from_query(query, target, columns))
    }

    pub fn count_from_query(&mut self, query: &ReadQuery) -> BulkResult<u64> {
        self.runtime.block_on(self.inner.count_from_query(query))
    }

    pub fn fetch_table_descriptor(&mut self, table: &TableName) -> BulkResult<TableDescriptor> {
        self.runtime
            .block_on(crate::schema::fetch_table_descriptor(
                self.inner.client(),
                table,
            ))
    }
}
