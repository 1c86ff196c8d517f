// Batched Background Migrations - engine core
//
// This crate walks large database tables in bounded batches, adapts the batch
// size to observed execution efficiency, splits or retries failing batches and
// halts when database health degrades.
//
// Infrastructure (clock, connections, metrics, error tracking, task queue) lives
// in kernel/, the engine itself in domains/batched_migrations/.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;

pub use config::*;
