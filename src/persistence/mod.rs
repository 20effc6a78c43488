//! Persistence module - SQLite instance registry and flat-file migration

mod database;
pub mod flatfile;

pub use database::InstanceRegistry;
pub use flatfile::ImportReport;
