//! Request and response bodies for the HTTP API.

pub mod analysis;
pub mod quota;
