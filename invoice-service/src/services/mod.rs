//! Services for invoice-service.

pub mod database;
pub mod metrics;
pub mod settlement;

pub use database::Database;
