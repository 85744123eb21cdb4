use super::{BinaryPart, GenerativeClient, GenerativeError};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

#[derive(Debug, Serialize)]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestPart<'a> {
    Text { text: &'a str },
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData<'a>,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData<'a> {
    mime_type: &'a str,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

/// Gemini `generateContent` over REST.
pub struct GeminiClient {
    client: reqwest::Client,
    endpoint: Url,
    model: String,
}

impl GeminiClient {
    pub fn new(base_url: &Url, model: &str, timeout: Duration) -> Result<Self, GenerativeError> {
        let endpoint = base_url
            .join(&format!("v1beta/models/{model}:generateContent"))
            .map_err(|e| GenerativeError::Config(format!("invalid model endpoint: {e}")))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl GenerativeClient for GeminiClient {
    #[instrument(skip(self, api_key, prompt, parts), fields(model = %self.model, parts = parts.len()), err)]
    async fn generate(&self, api_key: &str, prompt: &str, parts: &[BinaryPart]) -> Result<String, GenerativeError> {
        let mut request_parts = Vec::with_capacity(parts.len() + 1);
        request_parts.push(RequestPart::Text { text: prompt });
        request_parts.extend(parts.iter().map(|part| RequestPart::Inline {
            inline_data: InlineData {
                mime_type: &part.mime_type,
                data: STANDARD.encode(&part.data),
            },
        }));
        let body = GenerateContentRequest {
            contents: vec![Content {
                role: "user",
                parts: request_parts,
            }],
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerativeError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateContentResponse = response.json().await?;
        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| content.parts.into_iter().filter_map(|part| part.text).collect())
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(GenerativeError::EmptyResponse);
        }
        debug!(chars = text.len(), "Received generated content");
        Ok(text)
    }
}
