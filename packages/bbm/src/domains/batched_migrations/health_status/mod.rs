//! Health status evaluation.
//!
//! Every indicator inspects one aspect of live database health and votes with
//! exactly one [`Signal`]. The evaluator never fails: indicator errors become
//! `Unknown` signals and are reported to the error tracker. Deciding what to
//! do with the signals is left to the caller.

pub mod indicators;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;

use super::models::BatchedMigration;
use crate::kernel::EngineDeps;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Normal,
    Stop,
    Unknown,
    NotAvailable,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Stop => "stop",
            Self::Unknown => "unknown",
            Self::NotAvailable => "not_available",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    pub kind: SignalKind,
    /// Name of the indicator that produced the signal
    pub indicator: String,
    pub reason: String,
}

impl Signal {
    pub fn new(kind: SignalKind, indicator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind,
            indicator: indicator.into(),
            reason: reason.into(),
        }
    }

    pub fn normal(indicator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(SignalKind::Normal, indicator, reason)
    }

    pub fn stop(indicator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(SignalKind::Stop, indicator, reason)
    }

    pub fn unknown(indicator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(SignalKind::Unknown, indicator, reason)
    }

    pub fn not_available(indicator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(SignalKind::NotAvailable, indicator, reason)
    }

    pub fn is_stop(&self) -> bool {
        self.kind == SignalKind::Stop
    }

    /// Signals worth an info-level log line
    pub fn log_info(&self) -> bool {
        matches!(self.kind, SignalKind::Stop | SignalKind::Unknown)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind.as_str(), self.indicator, self.reason)
    }
}

/// What an indicator gets to look at
#[derive(Debug, Clone, PartialEq)]
pub struct HealthContext {
    pub migration_id: i64,
    pub schema_name: String,
    /// Tables written by the migration
    pub tables: Vec<String>,
}

impl HealthContext {
    pub fn for_migration(migration: &BatchedMigration) -> Self {
        Self {
            migration_id: migration.id,
            schema_name: migration.schema_name.clone(),
            tables: vec![migration.table_name.clone()],
        }
    }
}

#[async_trait]
pub trait HealthIndicator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn evaluate(&self, context: &HealthContext) -> Result<Signal>;
}

/// Evaluate `indicators` (or the configured default set) for a migration
pub async fn evaluate(
    migration: &BatchedMigration,
    indicators: Option<&[Arc<dyn HealthIndicator>]>,
    deps: &EngineDeps,
) -> Vec<Signal> {
    let indicators = indicators.unwrap_or(deps.indicators.as_slice());
    let context = HealthContext::for_migration(migration);
    let mut signals = Vec::with_capacity(indicators.len());

    for indicator in indicators {
        let signal = match indicator.evaluate(&context).await {
            Ok(signal) => signal,
            Err(e) => {
                deps.error_tracker.track_exception(
                    e.as_ref(),
                    json!({
                        "batched_migration_id": migration.id,
                        "indicator": indicator.name(),
                    }),
                );
                Signal::unknown(indicator.name(), format!("unexpected error: {}", e))
            }
        };

        if signal.log_info() {
            tracing::info!(
                batched_migration_id = migration.id,
                indicator = %signal.indicator,
                signal = signal.kind.as_str(),
                reason = %signal.reason,
                "Batched migration health signal"
            );
        }

        signals.push(signal);
    }

    signals
}

/// Indicator returning a fixed signal, for tests and manual overrides
pub struct StaticIndicator {
    name: &'static str,
    kind: SignalKind,
    reason: String,
}

impl StaticIndicator {
    pub fn new(name: &'static str, kind: SignalKind, reason: impl Into<String>) -> Self {
        Self {
            name,
            kind,
            reason: reason.into(),
        }
    }

    pub fn stop(reason: impl Into<String>) -> Self {
        Self::new("Static", SignalKind::Stop, reason)
    }

    pub fn normal() -> Self {
        Self::new("Static", SignalKind::Normal, "static normal signal")
    }
}

#[async_trait]
impl HealthIndicator for StaticIndicator {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn evaluate(&self, _context: &HealthContext) -> Result<Signal> {
        Ok(Signal::new(self.kind, self.name, self.reason.clone()))
    }
}
