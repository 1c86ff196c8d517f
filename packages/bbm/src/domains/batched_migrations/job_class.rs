//! Contract between the engine and migration job classes.
//!
//! A job class receives its batch bounds and collaborators in
//! [`JobArguments`], processes the batch in sub-batches, and reports what it
//! did through [`BatchMetrics`].

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use super::error::JobError;
use crate::common::Cursor;
use crate::kernel::BaseConnection;

#[async_trait]
pub trait BatchedMigrationJob: Send {
    /// Process the whole batch. Failures inside one sub-batch should be
    /// reported as [`JobError::SubBatch`].
    async fn perform(&mut self) -> Result<(), JobError>;

    fn batch_metrics(&self) -> &BatchMetrics;
}

/// Everything a job class is constructed with
#[derive(Clone)]
pub struct JobArguments {
    pub start_cursor: Cursor,
    pub end_cursor: Cursor,
    pub batch_table: String,
    pub batch_column: String,
    /// Batching key columns, `[batch_column]` for single-column keys
    pub batch_columns: Vec<String>,
    pub sub_batch_size: i64,
    pub pause_ms: i32,
    /// Class-specific arguments of the migration
    pub job_arguments: Value,
    pub connection: Arc<dyn BaseConnection>,
}

impl JobArguments {
    /// Bounds of the sub-batch starting at `from`, limited to the batch
    pub async fn next_sub_batch(&self, from: &Cursor) -> Result<Option<(Cursor, Cursor)>, JobError> {
        if from > &self.end_cursor {
            return Ok(None);
        }

        self.connection
            .key_window(
                &self.batch_table,
                &self.batch_columns,
                from,
                Some(&self.end_cursor),
                self.sub_batch_size,
            )
            .await
            .map_err(JobError::from)
    }

    /// Sub-batch ending at `upper` closes the batch
    pub fn is_last_sub_batch(&self, upper: &Cursor) -> bool {
        upper >= &self.end_cursor
    }

    /// Throttle between sub-batches
    pub async fn pause(&self) {
        if self.pause_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.pause_ms as u64)).await;
        }
    }

    /// Positional job argument
    pub fn argument(&self, index: usize) -> Option<&Value> {
        self.job_arguments.as_array().and_then(|args| args.get(index))
    }
}

/// Per-operation timings (seconds) and affected row counts of one batch
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchMetrics {
    pub timings: BTreeMap<String, Vec<f64>>,
    pub affected_rows: BTreeMap<String, i64>,
}

impl BatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` and record how long it took under `name`
    pub async fn instrument_operation<F, T>(&mut self, name: &str, operation: F) -> T
    where
        F: Future<Output = T>,
    {
        let started = tokio::time::Instant::now();
        let result = operation.await;
        self.record_timing(name, started.elapsed().as_secs_f64());
        result
    }

    pub fn record_timing(&mut self, name: &str, seconds: f64) {
        self.timings.entry(name.to_string()).or_default().push(seconds);
    }

    pub fn add_affected_rows(&mut self, name: &str, rows: i64) {
        *self.affected_rows.entry(name.to_string()).or_default() += rows;
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::InMemoryDatabase;
    use serde_json::json;

    fn arguments(db: Arc<InMemoryDatabase>, start: i64, end: i64, sub_batch_size: i64) -> JobArguments {
        JobArguments {
            start_cursor: Cursor::single(start),
            end_cursor: Cursor::single(end),
            batch_table: "events".into(),
            batch_column: "id".into(),
            batch_columns: vec!["id".into()],
            sub_batch_size,
            pause_ms: 0,
            job_arguments: json!(["title", "title_copy"]),
            connection: db,
        }
    }

    #[tokio::test]
    async fn sub_batches_stay_inside_the_batch() {
        let db = Arc::new(InMemoryDatabase::new());
        db.insert_range("events", 1..=20);
        let args = arguments(db, 1, 10, 4);

        let mut windows = Vec::new();
        let mut from = args.start_cursor.clone();
        while let Some((lo, hi)) = args.next_sub_batch(&from).await.unwrap() {
            windows.push((lo.first_value(), hi.first_value()));
            let Some(next) = hi.successor() else { break };
            from = next;
        }

        assert_eq!(windows, vec![(1, 4), (5, 8), (9, 10)]);
    }

    #[tokio::test]
    async fn only_the_batch_end_closes_the_last_sub_batch() {
        let db = Arc::new(InMemoryDatabase::new());
        db.insert_range("events", 1..=20);
        let args = arguments(db, 1, 10, 4);

        let mut last = Vec::new();
        let mut from = args.start_cursor.clone();
        while let Some((_, hi)) = args.next_sub_batch(&from).await.unwrap() {
            last.push(args.is_last_sub_batch(&hi));
            let Some(next) = hi.successor() else { break };
            from = next;
        }

        assert_eq!(last, vec![false, false, true]);
    }

    #[test]
    fn positional_arguments() {
        let args = arguments(Arc::new(InMemoryDatabase::new()), 1, 10, 4);
        assert_eq!(args.argument(1), Some(&json!("title_copy")));
        assert_eq!(args.argument(2), None);
    }

    #[tokio::test]
    async fn metrics_accumulate_per_operation() {
        let mut metrics = BatchMetrics::new();
        let rows = metrics.instrument_operation("update_all", async { 3 }).await;
        metrics.add_affected_rows("update_all", rows);
        metrics.instrument_operation("update_all", async {}).await;
        metrics.add_affected_rows("update_all", 2);

        assert_eq!(metrics.timings["update_all"].len(), 2);
        assert_eq!(metrics.affected_rows["update_all"], 5);
        assert_eq!(metrics.to_json()["affected_rows"]["update_all"], json!(5));
    }
}
