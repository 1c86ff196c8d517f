//! Stops migrations while the WAL archive queue is too long.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;

use crate::domains::batched_migrations::health_status::{HealthContext, HealthIndicator, Signal};

/// Number of WAL segments written but not yet archived
const PENDING_WAL_COUNT_SQL: &str = r#"
    WITH current_wal_file AS (
        SELECT pg_walfile_name(pg_current_wal_insert_lsn()) AS pg_walfile_name
    ),
    current_wal AS (
        SELECT ('x' || substring(pg_walfile_name, 9, 8))::bit(32)::int AS log,
               ('x' || substring(pg_walfile_name, 17, 8))::bit(32)::int AS seg
        FROM current_wal_file
    ),
    archive_wal AS (
        SELECT ('x' || substring(last_archived_wal, 9, 8))::bit(32)::int AS log,
               ('x' || substring(last_archived_wal, 17, 8))::bit(32)::int AS seg
        FROM pg_stat_archiver
        WHERE last_archived_wal IS NOT NULL
    )
    SELECT (((current_wal.log - archive_wal.log) * 256) + (current_wal.seg - archive_wal.seg))::bigint
    FROM current_wal, archive_wal
"#;

pub struct WriteAheadLog {
    pool: PgPool,
    limit: i64,
    enabled: bool,
}

impl WriteAheadLog {
    pub const NAME: &'static str = "WriteAheadLog";

    pub fn new(pool: PgPool, limit: i64, enabled: bool) -> Self {
        Self {
            pool,
            limit,
            enabled,
        }
    }

    async fn pending_wal_count(&self) -> Result<Option<i64>> {
        let in_recovery: bool = sqlx::query_scalar("SELECT pg_is_in_recovery()")
            .fetch_one(&self.pool)
            .await?;
        if in_recovery {
            return Ok(None);
        }

        sqlx::query_scalar::<_, i64>(PENDING_WAL_COUNT_SQL)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }
}

/// Signal for a pending WAL segment count against `limit`
pub fn wal_signal(pending: Option<i64>, limit: i64) -> Signal {
    match pending {
        None => Signal::not_available(
            WriteAheadLog::NAME,
            "WAL archive queue can not be calculated",
        ),
        Some(count) if count > limit => Signal::stop(
            WriteAheadLog::NAME,
            format!("WAL archive queue is too big ({} > {})", count, limit),
        ),
        Some(_) => Signal::normal(WriteAheadLog::NAME, "WAL archive queue is within limit"),
    }
}

#[async_trait]
impl HealthIndicator for WriteAheadLog {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn evaluate(&self, _context: &HealthContext) -> Result<Signal> {
        if !self.enabled {
            return Ok(Signal::not_available(Self::NAME, "indicator disabled"));
        }

        let pending = self.pending_wal_count().await?;
        Ok(wal_signal(pending, self.limit))
    }
}
