//! Copies source columns into destination columns of the same rows.
//!
//! Job arguments are `[source, destination]` for one column or
//! `[[sources...], [destinations...]]` for several.

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use serde_json::Value;

use crate::common::sql::{key_tuple, placeholders, quote_ident, quote_table};
use crate::common::Cursor;
use crate::domains::batched_migrations::error::JobError;
use crate::domains::batched_migrations::job_class::{BatchMetrics, BatchedMigrationJob, JobArguments};

pub const COPY_COLUMN_JOB: &str = "CopyColumn";

const OPERATION: &str = "update_all";

pub struct CopyColumnJob {
    args: JobArguments,
    metrics: BatchMetrics,
}

impl CopyColumnJob {
    pub fn new(args: JobArguments) -> Self {
        Self {
            args,
            metrics: BatchMetrics::new(),
        }
    }

    async fn update_sub_batch(
        &mut self,
        pool: &sqlx::PgPool,
        sql: &str,
        lower: &Cursor,
        upper: &Cursor,
    ) -> Result<i64, JobError> {
        let mut query = sqlx::query(sql);
        for value in lower.values().iter().chain(upper.values()) {
            query = query.bind(*value);
        }

        let result = self
            .metrics
            .instrument_operation(OPERATION, query.execute(pool))
            .await
            .map_err(|e| {
                let error = JobError::from(e);
                if error.is_timeout() {
                    JobError::sub_batch(error)
                } else {
                    error
                }
            })?;

        let rows = result.rows_affected() as i64;
        self.metrics.add_affected_rows(OPERATION, rows);
        Ok(rows)
    }
}

fn column_list(value: &Value) -> anyhow::Result<Vec<String>> {
    match value {
        Value::String(column) => Ok(vec![column.clone()]),
        Value::Array(columns) => columns
            .iter()
            .map(|c| {
                c.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("column names must be strings"))
            })
            .collect(),
        _ => bail!("column names must be strings"),
    }
}

/// `(sources, destinations)` from the migration's job arguments
pub fn copy_columns(job_arguments: &Value) -> anyhow::Result<(Vec<String>, Vec<String>)> {
    let (Some(sources), Some(destinations)) = (job_arguments.get(0), job_arguments.get(1)) else {
        bail!("CopyColumn expects [source, destination] job arguments");
    };

    let sources = column_list(sources)?;
    let destinations = column_list(destinations)?;
    if sources.is_empty() || sources.len() != destinations.len() {
        bail!("CopyColumn needs as many destination columns as source columns");
    }
    Ok((sources, destinations))
}

/// `UPDATE` statement copying `sources` into `destinations` over one key range
pub fn copy_sql(table: &str, key_columns: &[String], sources: &[String], destinations: &[String]) -> String {
    let assignments = destinations
        .iter()
        .zip(sources)
        .map(|(destination, source)| format!("{} = {}", quote_ident(destination), quote_ident(source)))
        .collect::<Vec<_>>()
        .join(", ");
    let key = key_tuple(key_columns);
    let width = key_columns.len();

    format!(
        "UPDATE {} SET {} WHERE {} >= {} AND {} <= {}",
        quote_table(table),
        assignments,
        key,
        placeholders(1, width),
        key,
        placeholders(width + 1, width)
    )
}

#[async_trait]
impl BatchedMigrationJob for CopyColumnJob {
    async fn perform(&mut self) -> Result<(), JobError> {
        let (sources, destinations) = copy_columns(&self.args.job_arguments)?;
        let pool = self
            .args
            .connection
            .pg_pool()
            .cloned()
            .ok_or_else(|| anyhow!("CopyColumn requires a Postgres connection"))?;
        let sql = copy_sql(&self.args.batch_table, &self.args.batch_columns, &sources, &destinations);

        let mut from = self.args.start_cursor.clone();
        while let Some((lower, upper)) = self.args.next_sub_batch(&from).await? {
            self.update_sub_batch(&pool, &sql, &lower, &upper).await?;
            if self.args.is_last_sub_batch(&upper) {
                break;
            }
            let Some(next) = upper.successor() else { break };
            from = next;
            self.args.pause().await;
        }
        Ok(())
    }

    fn batch_metrics(&self) -> &BatchMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::InMemoryDatabase;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn parses_single_and_multiple_columns() {
        assert_eq!(
            copy_columns(&json!(["title", "title_copy"])).unwrap(),
            (vec!["title".to_string()], vec!["title_copy".to_string()])
        );
        assert_eq!(
            copy_columns(&json!([["a", "b"], ["a2", "b2"]])).unwrap().1,
            vec!["a2".to_string(), "b2".to_string()]
        );
        assert!(copy_columns(&json!([["a", "b"], ["a2"]])).is_err());
        assert!(copy_columns(&json!([])).is_err());
    }

    #[test]
    fn builds_range_update() {
        let sql = copy_sql(
            "public.events",
            &["id".to_string()],
            &["title".to_string()],
            &["title_copy".to_string()],
        );
        assert_eq!(
            sql,
            r#"UPDATE "public"."events" SET "title_copy" = "title" WHERE "id" >= $1 AND "id" <= $2"#
        );
    }

    #[tokio::test]
    async fn requires_postgres_connection() {
        let mut job = CopyColumnJob::new(JobArguments {
            start_cursor: Cursor::single(1),
            end_cursor: Cursor::single(10),
            batch_table: "events".into(),
            batch_column: "id".into(),
            batch_columns: vec!["id".into()],
            sub_batch_size: 5,
            pause_ms: 0,
            job_arguments: json!(["title", "title_copy"]),
            connection: Arc::new(InMemoryDatabase::new()),
        });

        let err = job.perform().await.unwrap_err();
        assert!(matches!(err, JobError::Application(_)));
    }
}
