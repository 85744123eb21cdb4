//! Google Drive v3 backend.
//!
//! Uploads go in two steps: a media upload creates the file, then a metadata patch sets its name
//! and parent folder. Every request carries a bearer token from the configured [`TokenSource`].

use super::{BlobStorage, Result, StorageError, TokenSource};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
}

pub struct GoogleDriveStorage {
    client: reqwest::Client,
    base_url: Url,
    tokens: TokenSource,
    folder_id: Option<String>,
}

impl GoogleDriveStorage {
    pub fn new(base_url: Url, tokens: TokenSource, folder_id: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            tokens,
            folder_id,
        })
    }

    async fn bearer(&self) -> Result<String> {
        self.tokens.access_token(&self.client).await
    }

    fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|e| StorageError::Config(format!("invalid Google Drive URL: {e}")))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    fn file_url(&self, id: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = self.endpoint("drive/v3/files/", &[])?;
        url.path_segments_mut()
            .map_err(|_| StorageError::Config("Google Drive URL cannot be a base".to_string()))?
            .pop_if_empty()
            .push(id);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    async fn error_from(response: reqwest::Response) -> StorageError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        StorageError::Backend { status, body }
    }
}

#[async_trait]
impl BlobStorage for GoogleDriveStorage {
    #[instrument(skip(self, content), fields(size = content.len()), err)]
    async fn upload(&self, name: &str, content_type: &str, content: Bytes) -> Result<String> {
        let url = self.endpoint("upload/drive/v3/files", &[("uploadType", "media")])?;
        let response = self
            .client
            .post(url)
            .bearer_auth(self.bearer().await?)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(content)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        let created: DriveFile = response.json().await?;

        let query: Vec<(&str, &str)> = match self.folder_id.as_deref() {
            Some(folder) => vec![("addParents", folder)],
            None => Vec::new(),
        };
        let response = self
            .client
            .patch(self.file_url(&created.id, &query)?)
            .bearer_auth(self.bearer().await?)
            .json(&json!({ "name": name }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        debug!(id = %created.id, "Uploaded file to Google Drive");
        Ok(created.id)
    }

    #[instrument(skip(self), err)]
    async fn download(&self, id: &str) -> Result<Bytes> {
        let response = self
            .client
            .get(self.file_url(id, &[("alt", "media")])?)
            .bearer_auth(self.bearer().await?)
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(StorageError::NotFound(id.to_string())),
            status if status.is_success() => Ok(response.bytes().await?),
            _ => Err(Self::error_from(response).await),
        }
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, id: &str) -> Result<bool> {
        let response = self
            .client
            .delete(self.file_url(id, &[])?)
            .bearer_auth(self.bearer().await?)
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Err(Self::error_from(response).await),
        }
    }

    #[instrument(skip(self), err)]
    async fn exists(&self, id: &str) -> Result<bool> {
        let response = self
            .client
            .get(self.file_url(id, &[("fields", "id")])?)
            .bearer_auth(self.bearer().await?)
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Err(Self::error_from(response).await),
        }
    }
}
