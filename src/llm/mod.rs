pub mod backend;
pub mod decoder;

use crate::db::models::{ChatMessage, SourceMap};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use decoder::{FrameDecoder, PayloadStream};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub key: String,
}

/// Body of `POST /api/chat`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatRequest {
    pub conversation: Vec<ChatMessage>,
    pub model: ModelSpec,
    pub web_search: bool,
    pub tavily_api_key: String,
}

/// One decoded `data:` frame.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct StreamPayload {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub sources: Option<SourceMap>,
    /// Model name echoed by the backend.
    #[serde(default)]
    pub model: Option<String>,
    /// Failure text the backend emits in place of content.
    #[serde(default)]
    pub error: Option<String>,
}

impl StreamPayload {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn thinking(text: impl Into<String>) -> Self {
        Self {
            thinking: Some(text.into()),
            ..Default::default()
        }
    }
}

/// Opens a streamed reply for a chat request.
///
/// Dropping the returned stream aborts the underlying transfer.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open_stream(&self, request: &ChatRequest) -> Result<PayloadStream, LlmError>;
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
}

impl Serialize for LlmError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
