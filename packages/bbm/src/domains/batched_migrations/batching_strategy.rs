//! Batching strategies compute the key range of the next batch.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::common::Cursor;
use crate::kernel::BaseConnection;

pub const PRIMARY_KEY_BATCHING_STRATEGY: &str = "PrimaryKeyBatchingStrategy";

#[async_trait]
pub trait BatchingStrategy: Send + Sync {
    /// Bounds `(first, last)` of the next batch starting at `batch_min`.
    ///
    /// `first` is the smallest existing key `>= batch_min`; `last` is the
    /// `batch_size`-th key from there, or the last key of the table. `None`
    /// when no key remains.
    async fn next_batch(
        &self,
        table_name: &str,
        columns: &[String],
        batch_min: &Cursor,
        batch_size: i64,
        job_arguments: &Value,
        job_class_name: &str,
    ) -> Result<Option<(Cursor, Cursor)>>;
}

/// Walks the table in key order over existing rows
pub struct PrimaryKeyBatchingStrategy {
    connection: Arc<dyn BaseConnection>,
}

impl PrimaryKeyBatchingStrategy {
    pub fn new(connection: Arc<dyn BaseConnection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl BatchingStrategy for PrimaryKeyBatchingStrategy {
    async fn next_batch(
        &self,
        table_name: &str,
        columns: &[String],
        batch_min: &Cursor,
        batch_size: i64,
        _job_arguments: &Value,
        _job_class_name: &str,
    ) -> Result<Option<(Cursor, Cursor)>> {
        self.connection
            .key_window(table_name, columns, batch_min, None, batch_size)
            .await
    }
}
