//! Registry of job classes and batching strategies.
//!
//! Migrations store the names of their job class and batching strategy; the
//! registry turns those names into instances at execution time. Every process
//! populates it once at startup.

use std::collections::HashMap;
use std::sync::Arc;

use super::batching_strategy::{
    BatchingStrategy, PrimaryKeyBatchingStrategy, PRIMARY_KEY_BATCHING_STRATEGY,
};
use super::error::EngineError;
use super::job_class::{BatchedMigrationJob, JobArguments};
use crate::kernel::BaseConnection;

type JobFactory = Box<dyn Fn(JobArguments) -> Box<dyn BatchedMigrationJob> + Send + Sync>;
type StrategyFactory =
    Box<dyn Fn(Arc<dyn BaseConnection>) -> Arc<dyn BatchingStrategy> + Send + Sync>;

pub struct JobClassRegistry {
    jobs: HashMap<String, JobFactory>,
    strategies: HashMap<String, StrategyFactory>,
}

impl Default for JobClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobClassRegistry {
    /// Registry knowing the primary key batching strategy and no job classes
    pub fn new() -> Self {
        let mut registry = Self {
            jobs: HashMap::new(),
            strategies: HashMap::new(),
        };
        registry.register_batching_strategy(PRIMARY_KEY_BATCHING_STRATEGY, |connection| {
            Arc::new(PrimaryKeyBatchingStrategy::new(connection))
        });
        registry
    }

    /// Register a job class under `name`, replacing any previous registration
    pub fn register<J, F>(&mut self, name: impl Into<String>, factory: F)
    where
        J: BatchedMigrationJob + 'static,
        F: Fn(JobArguments) -> J + Send + Sync + 'static,
    {
        self.jobs.insert(
            name.into(),
            Box::new(move |arguments| Box::new(factory(arguments))),
        );
    }

    pub fn register_batching_strategy<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(Arc<dyn BaseConnection>) -> Arc<dyn BatchingStrategy> + Send + Sync + 'static,
    {
        self.strategies.insert(name.into(), Box::new(factory));
    }

    pub fn is_registered(&self, job_class_name: &str) -> bool {
        self.jobs.contains_key(job_class_name)
    }

    pub fn job_class_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.jobs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Instantiate the job class registered under `name`
    pub fn build(
        &self,
        name: &str,
        arguments: JobArguments,
    ) -> Result<Box<dyn BatchedMigrationJob>, EngineError> {
        let factory = self
            .jobs
            .get(name)
            .ok_or_else(|| EngineError::UnknownJobClass(name.to_string()))?;
        Ok(factory(arguments))
    }

    pub fn batching_strategy(
        &self,
        name: &str,
        connection: Arc<dyn BaseConnection>,
    ) -> Result<Arc<dyn BatchingStrategy>, EngineError> {
        let factory = self
            .strategies
            .get(name)
            .ok_or_else(|| EngineError::UnknownBatchingStrategy(name.to_string()))?;
        Ok(factory(connection))
    }
}
