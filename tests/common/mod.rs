#![allow(dead_code)]

use ai_chat_lib::db::models::{Chat, NewMessage, Role};
use ai_chat_lib::llm::{ChatRequest, ChatTransport, LlmError, PayloadStream};
use ai_chat_lib::settings::{ActiveModel, ProviderConfig, Settings};
use ai_chat_lib::{ChatSession, ChatStore, Database, StopHandle, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One scripted backend response.
pub enum Reply {
    /// Chunks delivered after the given delays (ms, relative to the previous
    /// chunk); `hang` keeps the transport open afterwards.
    Frames {
        chunks: Vec<(u64, String)>,
        hang: bool,
    },
    Status(u16),
    /// Chunks, then a transport error. `stop` is tripped just before the
    /// error surfaces, as when a stop tears the connection down.
    Broken {
        chunks: Vec<(u64, String)>,
        error: String,
        stop: Option<StopHandle>,
    },
    /// The request never gets a response.
    Stall,
}

impl Reply {
    pub fn frames(chunks: &[(u64, &str)]) -> Self {
        Reply::Frames {
            chunks: chunks.iter().map(|(d, c)| (*d, c.to_string())).collect(),
            hang: false,
        }
    }

    pub fn frames_then_hang(chunks: &[(u64, &str)]) -> Self {
        Reply::Frames {
            chunks: chunks.iter().map(|(d, c)| (*d, c.to_string())).collect(),
            hang: true,
        }
    }

    pub fn broken(chunks: &[(u64, &str)], error: &str) -> Self {
        Reply::Broken {
            chunks: chunks.iter().map(|(d, c)| (*d, c.to_string())).collect(),
            error: error.to_string(),
            stop: None,
        }
    }
}

pub fn content_frame(text: &str) -> String {
    format!("data: {}\n", serde_json::json!({ "content": text }))
}

#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn open_stream(&self, request: &ChatRequest) -> Result<PayloadStream, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .expect("no scripted reply left");

        match reply {
            Reply::Stall => futures::future::pending().await,
            Reply::Status(status) => Err(LlmError::Api {
                status,
                message: "scripted failure".into(),
            }),
            Reply::Frames { chunks, hang } => {
                let frames = stream::iter(chunks).then(|(delay, chunk)| async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok::<_, LlmError>(Bytes::from(chunk))
                });
                if hang {
                    Ok(PayloadStream::new(frames.chain(stream::pending())))
                } else {
                    Ok(PayloadStream::new(frames))
                }
            }
            Reply::Broken {
                chunks,
                error,
                stop,
            } => {
                let frames = stream::iter(chunks).then(|(delay, chunk)| async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok::<_, LlmError>(Bytes::from(chunk))
                });
                let failure = stream::once(async move {
                    if let Some(stop) = stop {
                        stop.stop_inference();
                    }
                    Err(LlmError::Parse(error))
                });
                Ok(PayloadStream::new(frames.chain(failure)))
            }
        }
    }
}

/// Store that can be told to refuse user turns.
pub struct FlakyStore {
    inner: Database,
    reject_user_turns: AtomicBool,
    user_turn_delay_ms: AtomicU64,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: Database::open_in_memory().unwrap(),
            reject_user_turns: AtomicBool::new(false),
            user_turn_delay_ms: AtomicU64::new(0),
        }
    }

    /// Makes every user-turn write take `delay`.
    pub fn slow_user_turns(&self, delay: Duration) {
        self.user_turn_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn reject_user_turns(&self, reject: bool) {
        self.reject_user_turns.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChatStore for FlakyStore {
    async fn get_chats(&self) -> Result<Vec<Chat>, StoreError> {
        self.inner.get_chats().await
    }

    async fn get_chat_by_id(&self, id: &str) -> Result<Option<Chat>, StoreError> {
        self.inner.get_chat_by_id(id).await
    }

    async fn create_chat(&self) -> Result<Chat, StoreError> {
        self.inner.create_chat().await
    }

    async fn update_chat(&self, chat: &Chat) -> Result<Chat, StoreError> {
        self.inner.update_chat(chat).await
    }

    async fn delete_chat(&self, id: &str) -> Result<bool, StoreError> {
        self.inner.delete_chat(id).await
    }

    async fn add_message_to_chat(
        &self,
        chat_id: &str,
        message: NewMessage,
    ) -> Result<Option<Chat>, StoreError> {
        if message.role == Role::User {
            let delay = self.user_turn_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.reject_user_turns.load(Ordering::SeqCst) {
                return Ok(None);
            }
        }
        self.inner.add_message_to_chat(chat_id, message).await
    }
}

pub fn groq_settings() -> Settings {
    Settings {
        providers: vec![ProviderConfig {
            name: "Groq".into(),
            api_key: "gsk_test".into(),
            models: "llama3-70b,mixtral-8x7b".into(),
        }],
        active: Some(ActiveModel {
            provider: "groq".into(),
            model: "llama3-70b".into(),
        }),
        web_search: true,
        tavily_api_key: "tvly_test".into(),
    }
}

pub fn session_with(
    replies: Vec<Reply>,
) -> (
    ChatSession<FlakyStore, ScriptedTransport>,
    Arc<FlakyStore>,
    Arc<ScriptedTransport>,
) {
    let store = Arc::new(FlakyStore::new());
    let transport = Arc::new(ScriptedTransport::new(replies));
    let session = ChatSession::new(store.clone(), transport.clone(), groq_settings());
    (session, store, transport)
}
