//! Small standalone utility modules used across the catalog, lock manager and page engine.
pub mod num;
