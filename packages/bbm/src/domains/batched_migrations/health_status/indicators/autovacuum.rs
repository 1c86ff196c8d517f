//! Stops migrations while autovacuum works on one of their tables.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use crate::domains::batched_migrations::health_status::{HealthContext, HealthIndicator, Signal};

/// One autovacuum worker as reported by `pg_stat_activity`
#[derive(Debug, Clone, FromRow)]
pub struct AutovacuumActivity {
    pub table_identifier: Option<String>,
    pub vacuum_start: Option<DateTime<Utc>>,
}

impl AutovacuumActivity {
    /// Matches `events`, `public.events` and `"public"."events"` alike
    fn is_on(&self, table: &str) -> bool {
        let Some(identifier) = &self.table_identifier else {
            return false;
        };
        let identifier = identifier.replace('"', "");
        let relation = identifier.rsplit('.').next().unwrap_or(&identifier);
        let wanted = table.rsplit('.').next().unwrap_or(table);

        identifier == table || relation == wanted
    }
}

pub struct AutovacuumActiveOnTable {
    pool: PgPool,
    enabled: bool,
}

impl AutovacuumActiveOnTable {
    pub const NAME: &'static str = "AutovacuumActiveOnTable";

    pub fn new(pool: PgPool, enabled: bool) -> Self {
        Self { pool, enabled }
    }

    async fn active_autovacuums(&self) -> Result<Vec<AutovacuumActivity>> {
        sqlx::query_as::<_, AutovacuumActivity>(
            r#"
            SELECT substring(query FROM 'autovacuum: (?:VACUUM|VACUUM ANALYZE|ANALYZE) ([^ ]+)') AS table_identifier,
                   xact_start AS vacuum_start
            FROM pg_stat_activity
            WHERE backend_type = 'autovacuum worker'
              AND query LIKE 'autovacuum: %'
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }
}

/// Signal for the given autovacuum activity on the context's tables
pub fn autovacuum_signal(activity: &[AutovacuumActivity], tables: &[String]) -> Signal {
    let active: Vec<String> = activity
        .iter()
        .filter(|a| tables.iter().any(|table| a.is_on(table)))
        .map(|a| {
            let started = a
                .vacuum_start
                .map(|start| start.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string());
            format!(
                "table {} (started: {})",
                a.table_identifier.as_deref().unwrap_or_default(),
                started
            )
        })
        .collect();

    if active.is_empty() {
        Signal::normal(
            AutovacuumActiveOnTable::NAME,
            "no autovacuum running on any relevant tables",
        )
    } else {
        Signal::stop(
            AutovacuumActiveOnTable::NAME,
            format!("autovacuum running on: {}", active.join(", ")),
        )
    }
}

#[async_trait]
impl HealthIndicator for AutovacuumActiveOnTable {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn evaluate(&self, context: &HealthContext) -> Result<Signal> {
        if !self.enabled {
            return Ok(Signal::not_available(Self::NAME, "indicator disabled"));
        }

        let activity = self.active_autovacuums().await?;
        Ok(autovacuum_signal(&activity, &context.tables))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::batched_migrations::health_status::SignalKind;

    fn activity(identifier: &str) -> AutovacuumActivity {
        AutovacuumActivity {
            table_identifier: Some(identifier.to_string()),
            vacuum_start: None,
        }
    }

    #[test]
    fn normal_when_vacuum_runs_elsewhere() {
        let signal = autovacuum_signal(&[activity("public.users")], &["events".to_string()]);
        assert_eq!(signal.kind, SignalKind::Normal);
    }

    #[test]
    fn stop_when_vacuum_runs_on_migrated_table() {
        let signal = autovacuum_signal(
            &[activity("public.users"), activity("public.events")],
            &["events".to_string()],
        );

        assert_eq!(signal.kind, SignalKind::Stop);
        assert!(signal.reason.starts_with("autovacuum running on: table public.events"));
    }
}
