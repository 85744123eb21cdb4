//! Axum route handlers, one module per resource.
//!
//! Handlers return [`crate::errors::Result`], so domain errors become HTTP responses through
//! [`crate::errors::Error`]'s `IntoResponse` implementation.

pub mod advice;
pub mod analysis;
pub mod health;
pub mod quota;
