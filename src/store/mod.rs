//! Persistence layer — libSQL-backed storage for rules, preferences,
//! learning candidates, processed emails, and runs.

pub mod libsql_backend;
pub mod migrations;
pub mod model;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, RunTotals};
