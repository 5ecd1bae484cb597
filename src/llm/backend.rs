use super::{ChatRequest, ChatTransport, LlmError, PayloadStream};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// HTTP client for the chat backend (`/api/chat` plus model listing).
#[derive(Debug, Clone)]
pub struct BackendClient {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
struct ModelListRequest<'a> {
    api_key: &'a str,
}

#[derive(Deserialize)]
struct ModelListResponse {
    data: Vec<ModelId>,
}

#[derive(Deserialize)]
struct ModelId {
    id: String,
}

/// Providers whose model catalogue the backend can list.
pub const LISTABLE_PROVIDERS: &[&str] = &["gemini", "groq"];

impl BackendClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Model ids the backend reports for `provider` using `api_key`.
    pub async fn fetch_models(&self, provider: &str, api_key: &str) -> Result<Vec<String>, LlmError> {
        if !LISTABLE_PROVIDERS.contains(&provider) {
            return Err(LlmError::Parse(format!(
                "Model listing is not supported for provider: {}",
                provider
            )));
        }

        let resp = self
            .client
            .post(format!("{}/api/{}/models", self.base_url, provider))
            .header("Content-Type", "application/json")
            .json(&ModelListRequest { api_key })
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status,
                message: format!("Failed to fetch {} models: {}", provider, text),
            });
        }

        let catalog: ModelListResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;
        Ok(catalog.data.into_iter().map(|m| m.id).collect())
    }
}

#[async_trait]
impl ChatTransport for BackendClient {
    async fn open_stream(&self, request: &ChatRequest) -> Result<PayloadStream, LlmError> {
        let resp = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(request)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status,
                message: text,
            });
        }

        tracing::debug!(status = resp.status().as_u16(), "chat stream opened");
        Ok(PayloadStream::new(
            resp.bytes_stream().map(|chunk| chunk.map_err(LlmError::from)),
        ))
    }
}
