/// PostgreSQL persistence for model records.
///
/// This module provides `PostgresModelRepository`, a PostgreSQL-backed
/// implementation of the [`crate::ModelRepository`] trait.
pub mod postgres;

pub use postgres::PostgresModelRepository;
