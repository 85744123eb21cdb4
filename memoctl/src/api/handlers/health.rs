use axum::http::StatusCode;

/// Liveness probe. Served outside `/api/v1`, so it is not part of the API document.
pub async fn healthz() -> StatusCode {
    StatusCode::OK
}
