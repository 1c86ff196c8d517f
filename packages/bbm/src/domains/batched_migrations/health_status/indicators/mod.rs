//! Default health indicators.

pub mod autovacuum;
pub mod patroni_apdex;
pub mod write_ahead_log;

use std::sync::Arc;

use sqlx::PgPool;

pub use autovacuum::AutovacuumActiveOnTable;
pub use patroni_apdex::PatroniApdex;
pub use write_ahead_log::WriteAheadLog;

use super::HealthIndicator;
use crate::config::IndicatorSettings;

/// Indicator set consulted before every execution in production
pub fn default_indicators(pool: PgPool, settings: &IndicatorSettings) -> Vec<Arc<dyn HealthIndicator>> {
    vec![
        Arc::new(AutovacuumActiveOnTable::new(
            pool.clone(),
            settings.is_enabled(AutovacuumActiveOnTable::NAME),
        )),
        Arc::new(WriteAheadLog::new(
            pool,
            settings.wal_pending_limit,
            settings.is_enabled(WriteAheadLog::NAME),
        )),
        Arc::new(PatroniApdex::new(
            settings.prometheus_url.clone(),
            settings.apdex_sli_query.clone(),
            settings.apdex_slo,
            settings.is_enabled(PatroniApdex::NAME),
        )),
    ]
}
