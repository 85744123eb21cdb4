//! HTTP API.
//!
//! - **[`handlers`]**: Axum route handlers
//! - **[`models`]**: Request and response bodies
//!
//! Routes live under `/api/v1`:
//!
//! - **Analysis** (`/analysis/*`): start a job's analysis and follow its runs
//! - **Advice** (`/advice`): one-off summary and advice for a note
//! - **Quota** (`/quota/*`): key checkout, usage overview and manual reset
//!
//! The OpenAPI document is served at `/api-docs/openapi.json` and rendered at `/docs`.

pub mod handlers;
pub mod models;
