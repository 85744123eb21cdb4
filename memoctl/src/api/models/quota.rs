use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A key handed out for direct use. It has already been charged one call.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CheckoutResponse {
    pub api_key: String,
}

/// Usage of one key in the current cycle. Never includes the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct KeyUsageResponse {
    pub code: String,
    pub usage: u32,
    /// Calls held by jobs that are still running
    pub reserved: u32,
    pub remaining: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct KeyUsageListResponse {
    pub capacity: u32,
    pub keys: Vec<KeyUsageResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ResetResponse {
    pub keys_reset: u64,
}
