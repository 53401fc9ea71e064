//! Main library entry point for postgres-tablesync.

pub mod args;
pub mod coerce;
pub mod column_map;
pub mod config;
pub mod destination;
pub mod error;
pub mod kept_data;
#[cfg(test)]
mod memory;
pub mod orchestrator;
pub mod row_inserter;
pub mod source;
pub mod swap;
pub mod table;

// Re-export key types for ergonomic access

pub use self::table::*;
pub use coerce::*;
pub use column_map::*;
pub use config::*;
pub use destination::*;
pub use error::*;
pub use kept_data::*;
pub use orchestrator::*;
pub use row_inserter::*;
pub use source::*;
pub use swap::*;
