//! Persistence layer: libSQL-backed lead store and delivery queue.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{DeliveryQueue, LeadStore};
