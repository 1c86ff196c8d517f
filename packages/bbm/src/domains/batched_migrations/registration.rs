//! Queueing new batched background migrations.

use anyhow::{ensure, Result};
use serde_json::Value;
use typed_builder::TypedBuilder;

use super::batching_strategy::PRIMARY_KEY_BATCHING_STRATEGY;
use super::error::EngineError;
use super::models::{BatchedMigration, MigrationStatus, NewMigration};
use crate::common::Cursor;
use crate::kernel::EngineDeps;

pub const DEFAULT_BATCH_SIZE: i64 = 1_000;
pub const DEFAULT_SUB_BATCH_SIZE: i64 = 100;
pub const DEFAULT_INTERVAL_SECS: i64 = 120;
pub const DEFAULT_BATCH_MIN_VALUE: i64 = 1;

/// Request to queue a migration over `table_name`
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct QueueMigration {
    pub job_class_name: String,
    pub table_name: String,
    pub column_name: String,
    #[builder(default = Value::Array(Vec::new()))]
    pub job_arguments: Value,
    /// Composite batching key; leave empty to batch over `column_name`
    #[builder(default)]
    pub cursor_columns: Vec<String>,
    #[builder(default = PRIMARY_KEY_BATCHING_STRATEGY.to_string())]
    pub batch_class_name: String,
    #[builder(default = DEFAULT_INTERVAL_SECS)]
    pub interval_secs: i64,
    /// Defaults to 1 (or the smallest key for composite keys)
    #[builder(default)]
    pub batch_min_value: Option<Cursor>,
    /// Defaults to the current largest key of the table
    #[builder(default)]
    pub batch_max_value: Option<Cursor>,
    #[builder(default = DEFAULT_BATCH_SIZE)]
    pub batch_size: i64,
    #[builder(default = DEFAULT_SUB_BATCH_SIZE)]
    pub sub_batch_size: i64,
    #[builder(default)]
    pub max_batch_size: Option<i64>,
    #[builder(default = 100)]
    pub pause_ms: i32,
    #[builder(default = "main".to_string())]
    pub schema_name: String,
}

impl QueueMigration {
    fn batch_columns(&self) -> Vec<String> {
        if self.cursor_columns.is_empty() {
            vec![self.column_name.clone()]
        } else {
            self.cursor_columns.clone()
        }
    }
}

/// Create an active migration, or a finished one when the table is empty.
///
/// Fails when the job class is unknown or an unfinished migration with the
/// same configuration exists.
pub async fn queue_batched_background_migration(
    request: QueueMigration,
    deps: &EngineDeps,
) -> Result<BatchedMigration> {
    if !deps.registry.is_registered(&request.job_class_name) {
        return Err(EngineError::UnknownJobClass(request.job_class_name).into());
    }
    deps.registry
        .batching_strategy(&request.batch_class_name, deps.connection.clone())?;

    ensure!(request.batch_size > 0, "batch_size must be positive");
    ensure!(request.sub_batch_size > 0, "sub_batch_size must be positive");
    ensure!(request.interval_secs > 0, "interval must be positive");

    let columns = request.batch_columns();
    let min_cursor = match &request.batch_min_value {
        Some(min) => min.clone(),
        None if columns.len() > 1 => deps
            .connection
            .min_key(&request.table_name, &columns)
            .await?
            .unwrap_or_else(|| Cursor::lower_bound(DEFAULT_BATCH_MIN_VALUE, columns.len())),
        None => Cursor::single(DEFAULT_BATCH_MIN_VALUE),
    };
    let max_cursor = match &request.batch_max_value {
        Some(max) => Some(max.clone()),
        None => deps.connection.max_key(&request.table_name, &columns).await?,
    };

    let status = if max_cursor.is_some() {
        MigrationStatus::Active
    } else {
        MigrationStatus::Finished
    };
    let total_tuple_count = deps.connection.estimate_row_count(&request.table_name).await?;

    let new = NewMigration::builder()
        .job_class_name(request.job_class_name)
        .batch_class_name(request.batch_class_name)
        .table_name(request.table_name)
        .column_name(request.column_name)
        .cursor_columns(request.cursor_columns)
        .job_arguments(request.job_arguments)
        .schema_name(request.schema_name)
        .max_cursor(max_cursor.unwrap_or_else(|| min_cursor.clone()))
        .min_cursor(min_cursor)
        .batch_size(request.batch_size)
        .sub_batch_size(request.sub_batch_size)
        .max_batch_size(request.max_batch_size)
        .interval_secs(request.interval_secs)
        .pause_ms(request.pause_ms)
        .status(status)
        .total_tuple_count(Some(total_tuple_count))
        .build();

    let migration = deps.store.create_migration(new, deps.now()).await?;

    tracing::info!(
        batched_migration_id = migration.id,
        migration_identifier = %migration.migration_identifier(),
        status = %migration.status,
        min_cursor = %migration.min_cursor,
        max_cursor = %migration.max_cursor,
        total_tuple_count,
        "Batched background migration queued"
    );
    Ok(migration)
}
