//! Database layer: error type, repositories and row models.
//!
//! Repositories borrow a `&mut PgConnection`, so callers decide whether they run on a pooled
//! connection or inside a transaction.

pub mod errors;
pub mod handlers;
pub mod models;
