//! Client seam for the generative-content API.

pub mod gemini;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use gemini::GeminiClient;

/// A binary document sent alongside a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryPart {
    pub mime_type: String,
    pub data: Bytes,
}

#[derive(Debug, Error)]
pub enum GenerativeError {
    #[error("Generative API request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Generative API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Generative API returned no text")]
    EmptyResponse,

    #[error("Invalid generative API configuration: {0}")]
    Config(String),
}

/// Generates text from a prompt plus binary parts, authenticated with one API key per call.
#[async_trait]
pub trait GenerativeClient: Send + Sync {
    async fn generate(&self, api_key: &str, prompt: &str, parts: &[BinaryPart]) -> Result<String, GenerativeError>;
}
