//! The one concrete [`crate::contracts::Storage`] backend shipped with this
//! crate.

pub mod postgres;

pub use postgres::PostgresStorage;
