//! Access tokens for Google APIs.
//!
//! An `authorized_user` credential (OAuth client plus refresh token) is exchanged at the token
//! endpoint for a short-lived access token, which is cached until shortly before it expires.

use super::{Result, StorageError};
use crate::config::DriveCredentials;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use url::Url;

/// Tokens this close to expiry are refreshed before use.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Seconds until the token expires
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

pub enum TokenSource {
    /// A token used as-is until the API rejects it
    Static(String),
    Refreshing(RefreshingToken),
}

impl TokenSource {
    pub async fn access_token(&self, client: &reqwest::Client) -> Result<String> {
        match self {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::Refreshing(refreshing) => refreshing.access_token(client).await,
        }
    }
}

pub struct RefreshingToken {
    token_url: Url,
    credentials: DriveCredentials,
    cached: Mutex<Option<CachedToken>>,
}

impl RefreshingToken {
    pub fn new(token_url: Url, credentials: DriveCredentials) -> Self {
        Self {
            token_url,
            credentials,
            cached: Mutex::new(None),
        }
    }

    /// The cached token, refreshed first when missing or about to expire.
    ///
    /// The lock is held across the refresh so concurrent callers wait for one exchange.
    pub async fn access_token(&self, client: &reqwest::Client) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && token.expires_at > Instant::now() + EXPIRY_MARGIN
        {
            return Ok(token.access_token.clone());
        }

        let fresh = self.refresh(client).await?;
        let access_token = fresh.access_token.clone();
        *cached = Some(fresh);
        Ok(access_token)
    }

    #[instrument(skip_all, fields(token_url = %self.token_url), err)]
    async fn refresh(&self, client: &reqwest::Client) -> Result<CachedToken> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "refresh_token")
            .append_pair("client_id", &self.credentials.client_id)
            .append_pair("client_secret", &self.credentials.client_secret)
            .append_pair("refresh_token", &self.credentials.refresh_token)
            .finish();

        let requested_at = Instant::now();
        let response = client
            .post(self.token_url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Auth(format!("token refresh returned {status}: {body}")));
        }
        let token: TokenResponse = response.json().await?;

        debug!(expires_in = token.expires_in, "Refreshed Google access token");
        Ok(CachedToken {
            access_token: token.access_token,
            expires_at: requested_at + Duration::from_secs(token.expires_in),
        })
    }
}
