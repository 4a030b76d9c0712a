//! Persistence layer for corral: connection pool, migrations, row models,
//! and all SQL. Every task mutation in the system goes through a query in
//! this crate; the store is the single source of truth for queue
//! membership, claim ownership, and versions.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
