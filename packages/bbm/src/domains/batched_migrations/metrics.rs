//! Prometheus metrics for batched migration jobs
//!
//! Every family is labelled with `migration_id` and `migration_identifier`
//! and registered on a caller-provided [`Registry`].

use prometheus::{
    GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use serde_json::Value;

use super::models::{BatchedJob, BatchedMigration, JobStatus};
use crate::kernel::BaseMetricsSink;

const LABELS: &[&str] = &["migration_id", "migration_identifier"];
const QUERY_LABELS: &[&str] = &["migration_id", "migration_identifier", "operation"];
const QUERY_DURATION_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 5.0];

pub struct PrometheusMetrics {
    batch_size: GaugeVec,
    sub_batch_size: GaugeVec,
    interval: GaugeVec,
    job_duration: GaugeVec,
    updated_tuples: IntCounterVec,
    migrated_tuples: GaugeVec,
    total_tuple_count: GaugeVec,
    last_update_time: GaugeVec,
    query_duration: HistogramVec,
}

impl PrometheusMetrics {
    /// Create the metric families and register them on `registry`
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let gauge = |name: &str, help: &str| GaugeVec::new(Opts::new(name, help), LABELS);

        let metrics = Self {
            batch_size: gauge("batched_migration_job_batch_size", "Batch size for a batched migration job")?,
            sub_batch_size: gauge(
                "batched_migration_job_sub_batch_size",
                "Sub-batch size for a batched migration job",
            )?,
            interval: gauge(
                "batched_migration_job_interval_seconds",
                "Interval for a batched migration job",
            )?,
            job_duration: gauge(
                "batched_migration_job_duration_seconds",
                "Duration for a batched migration job",
            )?,
            updated_tuples: IntCounterVec::new(
                Opts::new(
                    "batched_migration_job_updated_tuples_total",
                    "Number of tuples updated by batched migration job",
                ),
                LABELS,
            )?,
            migrated_tuples: gauge(
                "batched_migration_migrated_tuples_total",
                "Total number of tuples migrated by a batched migration",
            )?,
            total_tuple_count: gauge(
                "batched_migration_total_tuple_count",
                "Total tuple count the migration needs to touch",
            )?,
            last_update_time: gauge(
                "batched_migration_last_update_time_seconds",
                "Unix epoch time in seconds",
            )?,
            query_duration: HistogramVec::new(
                HistogramOpts::new(
                    "batched_migration_job_query_duration_seconds",
                    "Query timings for a batched migration job",
                )
                .buckets(QUERY_DURATION_BUCKETS.to_vec()),
                QUERY_LABELS,
            )?,
        };

        registry.register(Box::new(metrics.batch_size.clone()))?;
        registry.register(Box::new(metrics.sub_batch_size.clone()))?;
        registry.register(Box::new(metrics.interval.clone()))?;
        registry.register(Box::new(metrics.job_duration.clone()))?;
        registry.register(Box::new(metrics.updated_tuples.clone()))?;
        registry.register(Box::new(metrics.migrated_tuples.clone()))?;
        registry.register(Box::new(metrics.total_tuple_count.clone()))?;
        registry.register(Box::new(metrics.last_update_time.clone()))?;
        registry.register(Box::new(metrics.query_duration.clone()))?;

        Ok(metrics)
    }

    fn track_timings(&self, migration_id: &str, identifier: &str, metrics: &Value) {
        let Some(timings) = metrics.get("timings").and_then(Value::as_object) else {
            return;
        };

        for (operation, samples) in timings {
            let histogram = self
                .query_duration
                .with_label_values(&[migration_id, identifier, operation.as_str()]);
            for seconds in samples.as_array().into_iter().flatten().filter_map(Value::as_f64) {
                histogram.observe(seconds);
            }
        }
    }
}

impl BaseMetricsSink for PrometheusMetrics {
    fn track(&self, job: &BatchedJob, migration: &BatchedMigration, migrated_tuple_count: i64) {
        let migration_id = migration.id.to_string();
        let identifier = migration.migration_identifier();
        let labels = [migration_id.as_str(), identifier.as_str()];

        self.batch_size.with_label_values(&labels).set(job.batch_size as f64);
        self.sub_batch_size.with_label_values(&labels).set(job.sub_batch_size as f64);
        self.interval.with_label_values(&labels).set(migration.interval_secs as f64);
        if job.status == JobStatus::Succeeded {
            self.updated_tuples
                .with_label_values(&labels)
                .inc_by(job.batch_size.max(0) as u64);
        }
        self.migrated_tuples
            .with_label_values(&labels)
            .set(migrated_tuple_count as f64);
        self.total_tuple_count
            .with_label_values(&labels)
            .set(migration.total_tuple_count.unwrap_or_default() as f64);

        if let (Some(started_at), Some(finished_at)) = (job.started_at, job.finished_at) {
            let seconds = (finished_at - started_at).num_milliseconds() as f64 / 1000.0;
            self.job_duration.with_label_values(&labels).set(seconds);
        }

        let updated_at = job.finished_at.unwrap_or(job.updated_at);
        self.last_update_time
            .with_label_values(&labels)
            .set(updated_at.timestamp() as f64);

        self.track_timings(&migration_id, &identifier, &job.metrics);
    }
}

/// Registry contents in Prometheus text format
pub fn gather_metrics(registry: &Registry) -> String {
    TextEncoder::new()
        .encode_to_string(&registry.gather())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Cursor;
    use crate::domains::batched_migrations::models::{JobStatus, MigrationStatus};
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn migration() -> BatchedMigration {
        let now = Utc::now();
        BatchedMigration {
            id: 3,
            job_class_name: "CopyColumn".into(),
            batch_class_name: "PrimaryKeyBatchingStrategy".into(),
            table_name: "events".into(),
            column_name: "id".into(),
            cursor_columns: vec![],
            job_arguments: json!([]),
            schema_name: "main".into(),
            min_cursor: Cursor::single(1),
            max_cursor: Cursor::single(100),
            batch_size: 10,
            sub_batch_size: 5,
            max_batch_size: None,
            interval_secs: 120,
            pause_ms: 0,
            status: MigrationStatus::Active,
            total_tuple_count: Some(100),
            started_at: Some(now),
            finished_at: None,
            on_hold_until: None,
            lease_holder: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn succeeded_job() -> BatchedJob {
        let now = Utc::now();
        BatchedJob {
            id: 1,
            batched_background_migration_id: 3,
            min_cursor: Cursor::single(1),
            max_cursor: Cursor::single(10),
            batch_size: 10,
            sub_batch_size: 5,
            pause_ms: 0,
            status: JobStatus::Succeeded,
            attempts: 1,
            metrics: json!({"timings": {"update_all": [0.2, 0.3]}, "affected_rows": {"update_all": 10}}),
            started_at: Some(now - Duration::seconds(30)),
            finished_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn track_exports_labelled_families() {
        let registry = Registry::new();
        let metrics = PrometheusMetrics::new(&registry).unwrap();

        metrics.track(&succeeded_job(), &migration(), 10);
        metrics.track(&succeeded_job(), &migration(), 20);

        let output = gather_metrics(&registry);
        assert!(output.contains(
            r#"batched_migration_job_updated_tuples_total{migration_id="3",migration_identifier="CopyColumn/events.id"} 20"#
        ));
        assert!(output.contains(
            r#"batched_migration_migrated_tuples_total{migration_id="3",migration_identifier="CopyColumn/events.id"} 20"#
        ));
        assert!(output.contains(
            r#"batched_migration_job_duration_seconds{migration_id="3",migration_identifier="CopyColumn/events.id"} 30"#
        ));
        assert!(output.contains(r#"batched_migration_job_query_duration_seconds_count{migration_id="3",migration_identifier="CopyColumn/events.id",operation="update_all"} 4"#));
    }

    #[test]
    fn failed_jobs_export_gauges_but_no_updated_tuples() {
        let registry = Registry::new();
        let metrics = PrometheusMetrics::new(&registry).unwrap();
        let mut job = succeeded_job();
        job.status = JobStatus::Failed;

        metrics.track(&job, &migration(), 0);

        let output = gather_metrics(&registry);
        assert!(output.contains(
            r#"batched_migration_job_batch_size{migration_id="3",migration_identifier="CopyColumn/events.id"} 10"#
        ));
        assert!(output.contains(
            r#"batched_migration_job_duration_seconds{migration_id="3",migration_identifier="CopyColumn/events.id"} 30"#
        ));
        assert!(!output.contains(
            r#"batched_migration_job_updated_tuples_total{migration_id="3",migration_identifier="CopyColumn/events.id"} 10"#
        ));
    }

    #[test]
    fn registering_twice_fails() {
        let registry = Registry::new();
        PrometheusMetrics::new(&registry).unwrap();
        assert!(PrometheusMetrics::new(&registry).is_err());
    }
}
