// Common types shared across the engine

pub mod cursor;
pub mod sql;

pub use cursor::Cursor;
