use anyhow::{Context, Result};
use chrono::Duration;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use typed_builder::TypedBuilder;

/// Process configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Logical database this process schedules migrations for (e.g. `main`, `ci`)
    pub schema_name: String,
    pub metrics_port: u16,
    /// Cron expression (with seconds) driving the scheduler tick
    pub tick_cron: String,
    /// Number of task workers consuming dispatched migration runs
    pub task_workers: usize,
    pub indicators: IndicatorSettings,
    pub settings: EngineSettings,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            schema_name: env::var("BBM_SCHEMA").unwrap_or_else(|_| "main".to_string()),
            metrics_port: env::var("BBM_METRICS_PORT")
                .unwrap_or_else(|_| "9394".to_string())
                .parse()
                .context("BBM_METRICS_PORT must be a valid number")?,
            tick_cron: env::var("BBM_TICK_CRON").unwrap_or_else(|_| "0 * * * * *".to_string()),
            task_workers: env::var("BBM_TASK_WORKERS")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .context("BBM_TASK_WORKERS must be a valid number")?,
            indicators: IndicatorSettings::from_env()?,
            settings: EngineSettings::from_env()?,
        })
    }
}

/// Settings of the default health indicators
#[derive(Debug, Clone, PartialEq, TypedBuilder)]
pub struct IndicatorSettings {
    /// Indicator names that report NotAvailable instead of evaluating
    #[builder(default)]
    pub disabled: Vec<String>,
    /// Base URL of the Prometheus server queried by the apdex indicator
    #[builder(default)]
    pub prometheus_url: Option<String>,
    #[builder(default = DEFAULT_APDEX_SLI_QUERY.to_string())]
    pub apdex_sli_query: String,
    #[builder(default = 0.99)]
    pub apdex_slo: f64,
    /// Pending WAL archive segments above which writes must stop
    #[builder(default = 42)]
    pub wal_pending_limit: i64,
}

pub const DEFAULT_APDEX_SLI_QUERY: &str =
    r#"avg_over_time(gitlab_component_apdex:ratio_5m{type="patroni"}[5m])"#;

impl Default for IndicatorSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl IndicatorSettings {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            disabled: env::var("BBM_DISABLED_INDICATORS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|name| !name.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            prometheus_url: env::var("PROMETHEUS_URL").ok(),
            apdex_sli_query: env::var("BBM_APDEX_SLI_QUERY").unwrap_or(defaults.apdex_sli_query),
            apdex_slo: env_or("BBM_APDEX_SLO", defaults.apdex_slo)?,
            wal_pending_limit: env_or("BBM_WAL_PENDING_LIMIT", defaults.wal_pending_limit)?,
        })
    }

    pub fn is_enabled(&self, indicator: &str) -> bool {
        !self.disabled.iter().any(|name| name == indicator)
    }
}

/// Operational tuning knobs of the engine.
///
/// Defaults match production behaviour; every value can be overridden through
/// a `BBM_*` environment variable.
#[derive(Debug, Clone, PartialEq, TypedBuilder)]
pub struct EngineSettings {
    /// Attempts after which a failed job is no longer retried
    #[builder(default = 3)]
    pub max_attempts: i32,
    /// A running job without updates for this long is considered stuck
    #[builder(default = Duration::hours(1))]
    pub stuck_jobs_timeout: Duration,
    /// Jobs required before the failure ratio circuit breaker engages
    #[builder(default = 50)]
    pub minimum_jobs: i64,
    #[builder(default = 0.5)]
    pub maximum_failed_ratio: f64,
    /// How long a migration is put on hold when a health indicator says stop
    #[builder(default = Duration::minutes(10))]
    pub hold_duration: Duration,
    /// Tolerance subtracted from the interval when checking `interval_elapsed`
    #[builder(default = Duration::zero())]
    pub interval_variance: Duration,
    #[builder(default = 0.75)]
    pub sub_batch_reduce_factor: f64,
    /// Stop reducing once the sub-batch shrank by this percentage of the
    /// migration's configured sub-batch size
    #[builder(default)]
    pub sub_batch_size_threshold_percent: Option<f64>,
    /// Validity of a per-migration execution lease
    #[builder(default = Duration::minutes(5))]
    pub lease_ttl: Duration,
    #[builder(default = 100)]
    pub max_migrations_per_tick: i64,
    #[builder(default)]
    pub optimizer: OptimizerSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Knobs of the batch size optimizer
#[derive(Debug, Clone, PartialEq, TypedBuilder)]
pub struct OptimizerSettings {
    #[builder(default = 0.9)]
    pub target_efficiency_min: f64,
    #[builder(default = 0.95)]
    pub target_efficiency_max: f64,
    #[builder(default = 1_000)]
    pub min_batch_size: i64,
    #[builder(default = 10_000_000)]
    pub max_batch_size: i64,
    #[builder(default = 1.2)]
    pub max_multiplier: f64,
    #[builder(default = 20)]
    pub number_of_jobs: i64,
    #[builder(default = 0.4)]
    pub ema_alpha: f64,
    #[builder(default = true)]
    pub enabled: bool,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl EngineSettings {
    /// Load overrides from `BBM_*` environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let optimizer_defaults = OptimizerSettings::default();

        Ok(Self {
            max_attempts: env_or("BBM_MAX_ATTEMPTS", defaults.max_attempts)?,
            stuck_jobs_timeout: Duration::seconds(env_or(
                "BBM_STUCK_JOBS_TIMEOUT_SECS",
                defaults.stuck_jobs_timeout.num_seconds(),
            )?),
            minimum_jobs: env_or("BBM_MINIMUM_JOBS", defaults.minimum_jobs)?,
            maximum_failed_ratio: env_or("BBM_MAXIMUM_FAILED_RATIO", defaults.maximum_failed_ratio)?,
            hold_duration: Duration::seconds(env_or(
                "BBM_HOLD_DURATION_SECS",
                defaults.hold_duration.num_seconds(),
            )?),
            interval_variance: Duration::seconds(env_or(
                "BBM_INTERVAL_VARIANCE_SECS",
                defaults.interval_variance.num_seconds(),
            )?),
            sub_batch_reduce_factor: env_or(
                "BBM_SUB_BATCH_REDUCE_FACTOR",
                defaults.sub_batch_reduce_factor,
            )?,
            sub_batch_size_threshold_percent: env_opt("BBM_SUB_BATCH_SIZE_THRESHOLD_PERCENT")?,
            lease_ttl: Duration::seconds(env_or(
                "BBM_LEASE_TTL_SECS",
                defaults.lease_ttl.num_seconds(),
            )?),
            max_migrations_per_tick: env_or(
                "BBM_MAX_MIGRATIONS_PER_TICK",
                defaults.max_migrations_per_tick,
            )?,
            optimizer: OptimizerSettings {
                target_efficiency_min: env_or(
                    "BBM_TARGET_EFFICIENCY_MIN",
                    optimizer_defaults.target_efficiency_min,
                )?,
                target_efficiency_max: env_or(
                    "BBM_TARGET_EFFICIENCY_MAX",
                    optimizer_defaults.target_efficiency_max,
                )?,
                min_batch_size: env_or("BBM_MIN_BATCH_SIZE", optimizer_defaults.min_batch_size)?,
                max_batch_size: env_or("BBM_MAX_BATCH_SIZE", optimizer_defaults.max_batch_size)?,
                max_multiplier: env_or("BBM_MAX_MULTIPLIER", optimizer_defaults.max_multiplier)?,
                number_of_jobs: env_or(
                    "BBM_OPTIMIZER_NUMBER_OF_JOBS",
                    optimizer_defaults.number_of_jobs,
                )?,
                ema_alpha: env_or("BBM_OPTIMIZER_EMA_ALPHA", optimizer_defaults.ema_alpha)?,
                enabled: env_or("BBM_OPTIMIZER_ENABLED", optimizer_defaults.enabled)?,
            },
        })
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{} must be a valid value", key)),
        Err(_) => Ok(default),
    }
}

fn env_opt<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(key)
        .ok()
        .map(|raw| {
            raw.parse()
                .with_context(|| format!("{} must be a valid value", key))
        })
        .transpose()
}
