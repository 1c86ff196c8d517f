//! Batch size optimizer.
//!
//! Keeps the time efficiency of a migration's jobs (job duration divided by
//! the migration interval) inside a target band by scaling `batch_size`.
//! Growth is capped per pass; shrinking is not.

use anyhow::Result;

use super::models::BatchedMigration;
use crate::config::OptimizerSettings;
use crate::kernel::EngineDeps;

/// Exponentially weighted average of `efficiencies`, newest first.
///
/// The i-th value weighs `(1 - alpha)^i`. Rounded to two decimals; `None` for
/// an empty input.
pub fn exponential_moving_average(efficiencies: &[f64], alpha: f64) -> Option<f64> {
    let (dividend, divisor) = efficiencies
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(dividend, divisor), (i, efficiency)| {
            let weight = (1.0 - alpha).powi(i as i32);
            (dividend + efficiency * weight, divisor + weight)
        });

    if divisor == 0.0 {
        return None;
    }

    Some((dividend / divisor * 100.0).round() / 100.0)
}

/// Scale factor for `efficiency`, `None` when no change is needed
pub fn batch_size_multiplier(efficiency: Option<f64>, settings: &OptimizerSettings) -> Option<f64> {
    let efficiency = efficiency.filter(|e| *e > 0.0)?;
    if (settings.target_efficiency_min..=settings.target_efficiency_max).contains(&efficiency) {
        return None;
    }

    Some((settings.target_efficiency_max / efficiency).min(settings.max_multiplier))
}

/// New batch size after applying `multiplier`, clamped to the allowed range.
///
/// The upper bound is the lesser of the global maximum and the migration's own
/// `max_batch_size`; when that falls below the global minimum it wins.
pub fn compute_batch_size(
    batch_size: i64,
    multiplier: f64,
    migration_max_batch_size: Option<i64>,
    settings: &OptimizerSettings,
) -> i64 {
    let max_batch_size = migration_max_batch_size
        .map_or(settings.max_batch_size, |max| max.min(settings.max_batch_size));
    let scaled = (batch_size as f64 * multiplier) as i64;

    if max_batch_size < settings.min_batch_size {
        max_batch_size
    } else {
        scaled.clamp(settings.min_batch_size, max_batch_size)
    }
}

pub struct BatchOptimizer<'a> {
    deps: &'a EngineDeps,
}

impl<'a> BatchOptimizer<'a> {
    pub fn new(deps: &'a EngineDeps) -> Self {
        Self { deps }
    }

    /// Adjust and persist `migration.batch_size`. Returns whether it changed.
    pub async fn optimize(&self, migration: &mut BatchedMigration) -> Result<bool> {
        let settings = &self.deps.settings.optimizer;
        if !settings.enabled {
            return Ok(false);
        }

        let efficiency = migration
            .smoothed_time_efficiency(settings.number_of_jobs, settings.ema_alpha, self.deps)
            .await?;
        let Some(multiplier) = batch_size_multiplier(efficiency, settings) else {
            return Ok(false);
        };

        let old_batch_size = migration.batch_size;
        let new_batch_size =
            compute_batch_size(old_batch_size, multiplier, migration.max_batch_size, settings);
        if new_batch_size == old_batch_size {
            return Ok(false);
        }

        let now = self.deps.now();
        self.deps
            .store
            .update_batch_size(migration.id, new_batch_size, now)
            .await?;
        migration.batch_size = new_batch_size;
        migration.updated_at = now;

        tracing::info!(
            batched_migration_id = migration.id,
            migration_identifier = %migration.migration_identifier(),
            efficiency = efficiency.unwrap_or_default(),
            multiplier,
            old_batch_size,
            new_batch_size,
            "Batch size optimized"
        );
        Ok(true)
    }
}
