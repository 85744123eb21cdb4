//! Bearer-token gate for operator endpoints.

use crate::AppState;
use crate::errors::{Error, Result};
use axum::{extract::FromRequestParts, http::request::Parts};
use tracing::{instrument, trace};

/// Proof that the request carried the configured admin token.
///
/// Handlers that hand out key secrets or clear usage take this as an argument. With no
/// `admin_token` configured every request is refused.
#[derive(Debug, Clone, Copy)]
pub struct AdminCaller;

/// Compare without stopping at the first differing byte.
fn token_matches(presented: &str, expected: &str) -> bool {
    presented.len() == expected.len()
        && presented
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
}

impl FromRequestParts<AppState> for AdminCaller {
    type Rejection = Error;

    #[instrument(skip_all)]
    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let Some(expected) = state.config.admin_token.as_deref() else {
            return Err(Error::Unauthenticated {
                message: Some("Admin endpoints are disabled".to_string()),
            });
        };

        let presented = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));

        match presented {
            Some(token) if token_matches(token, expected) => Ok(AdminCaller),
            Some(_) => {
                trace!("Admin token mismatch");
                Err(Error::Unauthenticated {
                    message: Some("Invalid admin token".to_string()),
                })
            }
            None => Err(Error::Unauthenticated { message: None }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_must_match_exactly() {
        assert!(token_matches("abc123", "abc123"));
        assert!(!token_matches("abc124", "abc123"));
        assert!(!token_matches("abc12", "abc123"));
        assert!(!token_matches("", "abc123"));
    }
}
