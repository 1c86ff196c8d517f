pub mod batched_migrations;
