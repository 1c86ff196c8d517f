// TestDependencies - mock implementations for testing
//
// Provides in-memory doubles that can be injected into EngineDeps for tests.

use std::collections::{BTreeMap, HashMap};
use std::ops::{Bound, RangeInclusive};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

use super::{
    BaseClock, BaseConnection, BaseErrorTracker, BaseMetricsSink, EngineDeps, MigrationTask,
    TaskQueue,
};
use crate::common::Cursor;
use crate::config::EngineSettings;
use crate::domains::batched_migrations::health_status::HealthIndicator;
use crate::domains::batched_migrations::memory_store::InMemoryMigrationStore;
use crate::domains::batched_migrations::models::{BatchedJob, BatchedMigration, JobStatus};
use crate::domains::batched_migrations::registry::JobClassRegistry;

// =============================================================================
// Mock Clock
// =============================================================================

/// Clock that only moves when told to
pub struct MockClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClock {
    /// Clock fixed at 2026-01-01T00:00:00Z
    pub fn new() -> Self {
        Self::at(DateTime::from_timestamp(1_767_225_600, 0).unwrap_or_default())
    }

    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl BaseClock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// =============================================================================
// In-Memory Database
// =============================================================================

/// Tables of JSON rows keyed by cursor
#[derive(Default)]
pub struct InMemoryDatabase {
    tables: RwLock<HashMap<String, BTreeMap<Cursor, Value>>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_row(&self, table: &str, key: Cursor, row: Value) {
        self.tables
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(table.to_string())
            .or_default()
            .insert(key, row);
    }

    /// Insert `{"id": n}` for every key in `keys`
    pub fn insert_range(&self, table: &str, keys: RangeInclusive<i64>) {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let rows = tables.entry(table.to_string()).or_default();
        for key in keys {
            rows.insert(Cursor::single(key), json!({ "id": key }));
        }
    }

    pub fn row(&self, table: &str, key: &Cursor) -> Option<Value> {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(table)
            .and_then(|rows| rows.get(key).cloned())
    }

    /// Apply `update` to every row with `from <= key <= to`, returning the
    /// number of rows touched
    pub fn update_range<F>(&self, table: &str, from: &Cursor, to: &Cursor, mut update: F) -> i64
    where
        F: FnMut(&mut Value),
    {
        if from > to {
            return 0;
        }

        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let Some(rows) = tables.get_mut(table) else {
            return 0;
        };

        let mut touched = 0;
        for (_, row) in rows.range_mut(from.clone()..=to.clone()) {
            update(row);
            touched += 1;
        }
        touched
    }

    pub fn rows(&self, table: &str) -> Vec<(Cursor, Value)> {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(table)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BaseConnection for InMemoryDatabase {
    async fn key_window(
        &self,
        table: &str,
        _columns: &[String],
        from: &Cursor,
        upper: Option<&Cursor>,
        size: i64,
    ) -> Result<Option<(Cursor, Cursor)>> {
        if upper.is_some_and(|upper| upper < from) {
            return Ok(None);
        }

        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let Some(rows) = tables.get(table) else {
            return Ok(None);
        };

        let upper_bound = match upper {
            Some(upper) => Bound::Included(upper.clone()),
            None => Bound::Unbounded,
        };
        let mut keys = rows
            .range((Bound::Included(from.clone()), upper_bound))
            .map(|(key, _)| key);

        let Some(first) = keys.next() else {
            return Ok(None);
        };
        let take = (size.max(1) - 1) as usize;
        let last = keys.take(take).last().unwrap_or(first);

        Ok(Some((first.clone(), last.clone())))
    }

    async fn min_key(&self, table: &str, _columns: &[String]) -> Result<Option<Cursor>> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        Ok(tables
            .get(table)
            .and_then(|rows| rows.keys().next().cloned()))
    }

    async fn max_key(&self, table: &str, _columns: &[String]) -> Result<Option<Cursor>> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        Ok(tables
            .get(table)
            .and_then(|rows| rows.keys().next_back().cloned()))
    }

    async fn estimate_row_count(&self, table: &str) -> Result<i64> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        Ok(tables.get(table).map(|rows| rows.len() as i64).unwrap_or(0))
    }
}

// =============================================================================
// Spy Error Tracker
// =============================================================================

#[derive(Debug, Clone)]
pub struct TrackedException {
    pub message: String,
    pub context: Value,
}

#[derive(Default)]
pub struct SpyErrorTracker {
    tracked: Mutex<Vec<TrackedException>>,
}

impl SpyErrorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracked(&self) -> Vec<TrackedException> {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl BaseErrorTracker for SpyErrorTracker {
    fn track_exception(
        &self,
        error: &(dyn std::error::Error + Send + Sync + 'static),
        context: Value,
    ) {
        self.tracked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(TrackedException {
                message: error.to_string(),
                context,
            });
    }
}

// =============================================================================
// Spy Metrics Sink
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedJob {
    pub job_id: i64,
    pub migration_id: i64,
    pub status: JobStatus,
    pub batch_size: i64,
    pub migrated_tuple_count: i64,
}

#[derive(Default)]
pub struct SpyMetricsSink {
    tracked: Mutex<Vec<TrackedJob>>,
}

impl SpyMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracked(&self) -> Vec<TrackedJob> {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl BaseMetricsSink for SpyMetricsSink {
    fn track(&self, job: &BatchedJob, migration: &BatchedMigration, migrated_tuple_count: i64) {
        self.tracked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(TrackedJob {
                job_id: job.id,
                migration_id: migration.id,
                status: job.status,
                batch_size: job.batch_size,
                migrated_tuple_count,
            });
    }
}

// =============================================================================
// Recording Task Queue
// =============================================================================

#[derive(Default)]
pub struct RecordingTaskQueue {
    submitted: Mutex<Vec<MigrationTask>>,
}

impl RecordingTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> Vec<MigrationTask> {
        self.submitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl TaskQueue for RecordingTaskQueue {
    async fn submit(&self, task: MigrationTask) -> Result<()> {
        self.submitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
        Ok(())
    }
}

// =============================================================================
// TestDependencies
// =============================================================================

/// In-memory engine wiring with handles to every double
pub struct TestDependencies {
    pub store: Arc<InMemoryMigrationStore>,
    pub database: Arc<InMemoryDatabase>,
    pub clock: Arc<MockClock>,
    pub error_tracker: Arc<SpyErrorTracker>,
    pub metrics: Arc<SpyMetricsSink>,
    pub registry: Arc<JobClassRegistry>,
    pub indicators: Vec<Arc<dyn HealthIndicator>>,
    pub settings: EngineSettings,
}

impl Default for TestDependencies {
    fn default() -> Self {
        Self::new()
    }
}

impl TestDependencies {
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemoryMigrationStore::new()),
            database: Arc::new(InMemoryDatabase::new()),
            clock: Arc::new(MockClock::new()),
            error_tracker: Arc::new(SpyErrorTracker::new()),
            metrics: Arc::new(SpyMetricsSink::new()),
            registry: Arc::new(JobClassRegistry::new()),
            indicators: Vec::new(),
            settings: EngineSettings::default(),
        }
    }

    pub fn with_database(mut self, database: Arc<InMemoryDatabase>) -> Self {
        self.database = database;
        self
    }

    pub fn with_clock(mut self, clock: Arc<MockClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_registry(mut self, registry: JobClassRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_indicator(mut self, indicator: Arc<dyn HealthIndicator>) -> Self {
        self.indicators.push(indicator);
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn deps(&self) -> EngineDeps {
        EngineDeps {
            store: self.store.clone(),
            connection: self.database.clone(),
            clock: self.clock.clone(),
            error_tracker: self.error_tracker.clone(),
            metrics: self.metrics.clone(),
            registry: self.registry.clone(),
            indicators: self.indicators.clone(),
            settings: self.settings.clone(),
        }
    }
}
