//! Handlers for the API key pool.

use crate::AppState;
use crate::api::models::quota::{CheckoutResponse, KeyUsageListResponse, KeyUsageResponse, ResetResponse};
use crate::auth::AdminCaller;
use crate::errors::Result;
use crate::quota::QuotaError;
use axum::{Json, extract::State};
use tracing::info;

#[utoipa::path(
    post,
    path = "/quota/checkout",
    tag = "quota",
    summary = "Check out an API key",
    description = "Returns the first key with capacity left and charges it one call. Requires the \
admin bearer token.",
    responses(
        (status = 200, description = "Key checked out", body = CheckoutResponse),
        (status = 401, description = "Missing or invalid admin token"),
        (status = 429, description = "Every key is at capacity"),
        (status = 503, description = "No keys are configured"),
        (status = 500, description = "Internal server error")
    )
)]
#[tracing::instrument(skip_all)]
pub async fn checkout_key(_admin: AdminCaller, State(state): State<AppState>) -> Result<Json<CheckoutResponse>> {
    let api_key = state.analyzer.checkout_key().await?;
    Ok(Json(CheckoutResponse { api_key }))
}

#[utoipa::path(
    get,
    path = "/quota/keys",
    tag = "quota",
    summary = "List key usage",
    responses(
        (status = 200, description = "Usage of every active key", body = KeyUsageListResponse),
        (status = 500, description = "Internal server error")
    )
)]
#[tracing::instrument(skip_all)]
pub async fn list_key_usage(State(state): State<AppState>) -> Result<Json<KeyUsageListResponse>> {
    let allocator = state.analyzer.allocator();
    let capacity = allocator.capacity();

    let records = match allocator.store().list_active_keys().await {
        Ok(records) => records,
        Err(QuotaError::NoCredentialsAvailable) => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    let reserved = allocator.reserved().await;

    let keys = records
        .into_iter()
        .map(|record| {
            let reserved = reserved.get(&record.secret).copied().unwrap_or(0);
            KeyUsageResponse {
                remaining: capacity.saturating_sub(record.usage_count).saturating_sub(reserved),
                code: record.code,
                usage: record.usage_count,
                reserved,
            }
        })
        .collect();

    Ok(Json(KeyUsageListResponse { capacity, keys }))
}

#[utoipa::path(
    post,
    path = "/quota/reset",
    tag = "quota",
    summary = "Reset key usage",
    description = "Starts a new quota cycle immediately. The scheduled daily reset does the same. \
Requires the admin bearer token.",
    responses(
        (status = 200, description = "Counters reset", body = ResetResponse),
        (status = 401, description = "Missing or invalid admin token"),
        (status = 500, description = "Internal server error")
    )
)]
#[tracing::instrument(skip_all)]
pub async fn reset_usage(_admin: AdminCaller, State(state): State<AppState>) -> Result<Json<ResetResponse>> {
    let keys_reset = state.analyzer.allocator().store().reset_usage().await?;
    info!(keys_reset, "API key usage reset on request");
    Ok(Json(ResetResponse { keys_reset }))
}
