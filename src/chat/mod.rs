//! Send → stream → finalize/cancel → persist.
//!
//! [`ChatSession`] owns the targeted chat, the active cancellation token and
//! the view channels. At most one reply streams per session; a new send
//! cancels whatever was in flight first.

pub mod history;
pub mod notifier;
pub mod session;

use crate::db::models::{Chat, ChatMessage, NewMessage};
use crate::db::{ChatStore, StoreError};
use crate::llm::{ChatRequest, ChatTransport, LlmError, ModelSpec, StreamPayload};
use crate::settings::{resolve_api_key, resolve_provider, Settings, PROVIDER_NOT_FOUND};
use futures::StreamExt;
use notifier::{StreamView, ViewNotifier};
use session::{FinishCause, StreamSession};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Transport(#[from] LlmError),
    #[error(transparent)]
    Persistence(#[from] StoreError),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("No chat selected")]
    NoActiveChat,
    #[error("No active model configured")]
    NoActiveModel,
}

impl ChatError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Sending,
    Streaming,
    Finalizing,
    Cancelling,
    Erroring,
}

/// Result of [`ChatSession::send_message`]. Failures are reported here
/// rather than as `Err`; the session is back to idle in every case.
#[derive(Debug)]
pub enum SendOutcome {
    /// Blank content; nothing happened.
    Ignored,
    /// The stream ended; carries the persisted reply, if the store took it.
    Completed(Option<ChatMessage>),
    /// Stopped by the user; carries the persisted partial reply, if any.
    Cancelled(Option<ChatMessage>),
    Failed(ChatError),
}

impl SendOutcome {
    pub fn message(&self) -> Option<&ChatMessage> {
        match self {
            SendOutcome::Completed(m) | SendOutcome::Cancelled(m) => m.as_ref(),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ChatError> {
        match self {
            SendOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Cloneable handle that stops the reply currently streaming.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    active: Arc<Mutex<Option<CancellationToken>>>,
}

impl StopHandle {
    /// Returns `false` when nothing was streaming.
    pub fn stop_inference(&self) -> bool {
        match self.slot().take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn install(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.slot().replace(token.clone()) {
            previous.cancel();
        }
        token
    }

    fn clear(&self) {
        self.slot().take();
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct ChatSession<S, T> {
    store: Arc<S>,
    transport: Arc<T>,
    settings: Settings,
    chat_id: Option<String>,
    state: SessionState,
    stop: StopHandle,
    notifier: ViewNotifier,
    chats: watch::Sender<Vec<Chat>>,
}

/// Model identity stamped on both turns of an exchange.
struct ReplyModel {
    name: String,
    provider: Option<String>,
}

impl<S, T> ChatSession<S, T>
where
    S: ChatStore,
    T: ChatTransport,
{
    pub fn new(store: Arc<S>, transport: Arc<T>, settings: Settings) -> Self {
        let (chats, _rx) = watch::channel(Vec::new());
        Self {
            store,
            transport,
            settings,
            chat_id: None,
            state: SessionState::Idle,
            stop: StopHandle::default(),
            notifier: ViewNotifier::default(),
            chats,
        }
    }

    pub fn with_publish_interval(mut self, interval: Duration) -> Self {
        self.notifier = ViewNotifier::new(interval);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: Settings) {
        self.settings = settings;
    }

    pub fn current_chat_id(&self) -> Option<&str> {
        self.chat_id.as_deref()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// No-op when idle.
    pub fn stop_inference(&self) -> bool {
        self.stop.stop_inference()
    }

    pub fn subscribe_stream(&self) -> watch::Receiver<Option<StreamView>> {
        self.notifier.subscribe()
    }

    pub fn subscribe_chats(&self) -> watch::Receiver<Vec<Chat>> {
        self.chats.subscribe()
    }

    /// Next send goes to a fresh chat.
    pub fn start_new_chat(&mut self) {
        self.stop.stop_inference();
        self.chat_id = None;
        self.notifier.flush(None);
    }

    pub async fn select_chat(&mut self, chat_id: &str) -> Result<Chat, ChatError> {
        let chat = self
            .store
            .get_chat_by_id(chat_id)
            .await?
            .ok_or_else(|| ChatError::not_found("chat", chat_id))
            .inspect_err(|e| warn!(error = %e, "cannot select chat"))?;
        self.stop.stop_inference();
        self.chat_id = Some(chat.id.clone());
        self.notifier.flush(None);
        Ok(chat)
    }

    pub async fn current_chat(&self) -> Result<Chat, ChatError> {
        let id = self.chat_id.as_deref().ok_or(ChatError::NoActiveChat)?;
        self.store
            .get_chat_by_id(id)
            .await?
            .ok_or_else(|| ChatError::not_found("chat", id))
    }

    pub async fn delete_chat(&mut self, chat_id: &str) -> Result<(), ChatError> {
        if self.chat_id.as_deref() == Some(chat_id) {
            self.start_new_chat();
        }
        if !self.store.delete_chat(chat_id).await? {
            let err = ChatError::not_found("chat", chat_id);
            warn!(error = %err, "delete skipped");
            return Err(err);
        }
        self.refresh_chats().await?;
        Ok(())
    }

    pub async fn refresh_chats(&mut self) -> Result<Vec<Chat>, ChatError> {
        let chats = self.store.get_chats().await?;
        self.chats.send_replace(chats.clone());
        Ok(chats)
    }

    pub async fn send_message(&mut self, content: &str) -> SendOutcome {
        if content.trim().is_empty() {
            debug!("ignoring blank message");
            return SendOutcome::Ignored;
        }

        // cancels whatever was streaming; stops from here on hit this send
        let token = self.stop.install();
        self.transition(SessionState::Sending);
        let outcome = self.dispatch(content, token).await;
        self.stop.clear();
        self.transition(SessionState::Idle);
        outcome
    }

    async fn dispatch(&mut self, content: &str, token: CancellationToken) -> SendOutcome {
        let send_start = Instant::now();

        let (chat_id, created_here) = match self.chat_id.clone() {
            Some(id) => (id, false),
            None => match self.store.create_chat().await {
                Ok(chat) => (chat.id, true),
                Err(e) => return self.fail(e.into()),
            },
        };
        self.chat_id = Some(chat_id.clone());

        let model = self.active_model();
        let user_turn = NewMessage {
            model: model.as_ref().map(|m| m.name.clone()),
            provider: model.as_ref().and_then(|m| m.provider.clone()),
            ..NewMessage::user(content)
        };
        let chat = match self.store.add_message_to_chat(&chat_id, user_turn).await {
            Ok(Some(chat)) => chat,
            Ok(None) => {
                debug!(chat_id = %chat_id, "store rejected user turn");
                if created_here {
                    self.discard_chat(&chat_id).await;
                }
                return SendOutcome::Ignored;
            }
            Err(e) => {
                if created_here {
                    self.discard_chat(&chat_id).await;
                }
                return self.fail(e.into());
            }
        };

        if token.is_cancelled() {
            info!(chat_id = %chat_id, "stopped before the request was sent");
            return self.stopped_before_reply().await;
        }

        let Some(model) = model else {
            return self.fail(ChatError::NoActiveModel);
        };
        let request = self.build_request(&chat, &model);

        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            opened = self.transport.open_stream(&request) => Some(opened),
        };
        let mut stream = match opened {
            Some(Ok(stream)) => stream,
            Some(Err(e)) => return self.fail(e.into()),
            None => {
                info!(chat_id = %chat_id, "stopped before the stream opened");
                return self.stopped_before_reply().await;
            }
        };

        self.transition(SessionState::Streaming);
        let mut session = StreamSession::new(send_start);
        let ended = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break Ok(FinishCause::Cancelled),
                item = stream.next() => match item {
                    Some(Ok(payload)) => self.on_payload(&mut session, &chat_id, &payload),
                    Some(Err(_)) if token.is_cancelled() => break Ok(FinishCause::Cancelled),
                    Some(Err(e)) => break Err(e),
                    None => break Ok(FinishCause::Completed),
                },
            }
        };

        match ended {
            Ok(FinishCause::Completed) => {
                self.transition(SessionState::Finalizing);
                drop(stream);
                let message = self
                    .finalize(session, FinishCause::Completed, &chat_id, model)
                    .await;
                SendOutcome::Completed(message)
            }
            Ok(FinishCause::Cancelled) => {
                self.transition(SessionState::Cancelling);
                let now = Instant::now();
                for payload in stream.drain_buffered() {
                    session.apply(&payload, now);
                }
                drop(stream);
                let message = self
                    .finalize(session, FinishCause::Cancelled, &chat_id, model)
                    .await;
                SendOutcome::Cancelled(message)
            }
            Err(e) => {
                self.notifier.flush(None);
                self.fail(e.into())
            }
        }
    }

    fn on_payload(&mut self, session: &mut StreamSession, chat_id: &str, payload: &StreamPayload) {
        if let Some(error) = payload.error.as_deref() {
            warn!(chat_id = %chat_id, error = %error, "backend reported an error mid-stream");
        }
        let now = Instant::now();
        session.apply(payload, now);
        self.notifier
            .publish_throttled(now, || session.view(chat_id, true));
    }

    /// Computes timings and persists the assistant turn for either cause.
    async fn finalize(
        &mut self,
        session: StreamSession,
        cause: FinishCause,
        chat_id: &str,
        model: ReplyModel,
    ) -> Option<ChatMessage> {
        let final_view = session.view(chat_id, false);
        let persisted = match session.finalize(cause, Instant::now()) {
            None => {
                info!(chat_id = %chat_id, "stopped before any content; nothing persisted");
                None
            }
            Some(reply) => {
                info!(
                    chat_id = %chat_id,
                    ?cause,
                    duration_ms = reply.duration,
                    thinking_ms = ?reply.thinking_duration,
                    chars = reply.content.len(),
                    "reply finished"
                );
                let message = reply.into_message(Some(model.name), model.provider);
                match self.store.add_message_to_chat(chat_id, message).await {
                    Ok(Some(chat)) => chat.messages.last().cloned(),
                    Ok(None) => {
                        warn!(chat_id = %chat_id, "store rejected the assistant reply");
                        None
                    }
                    Err(e) => {
                        warn!(chat_id = %chat_id, error = %e, "failed to persist assistant reply");
                        None
                    }
                }
            }
        };

        self.notifier.flush(Some(final_view));
        if let Err(e) = self.refresh_chats().await {
            warn!(error = %e, "failed to refresh chat list");
        }
        persisted
    }

    /// Ends a send that was stopped before any reply streamed.
    async fn stopped_before_reply(&mut self) -> SendOutcome {
        self.transition(SessionState::Cancelling);
        self.notifier.flush(None);
        if let Err(e) = self.refresh_chats().await {
            warn!(error = %e, "failed to refresh chat list");
        }
        SendOutcome::Cancelled(None)
    }

    fn active_model(&self) -> Option<ReplyModel> {
        let name = self.settings.active.as_ref()?.model.clone();
        let provider = resolve_provider(&self.settings, &name);
        let provider = if provider == PROVIDER_NOT_FOUND {
            warn!(model = %name, "no configured provider serves the active model");
            None
        } else {
            Some(provider)
        };
        Some(ReplyModel { name, provider })
    }

    fn build_request(&self, chat: &Chat, model: &ReplyModel) -> ChatRequest {
        let conversation = chat
            .messages
            .iter()
            .filter(|m| is_sendable(&m.content))
            .cloned()
            .collect();
        ChatRequest {
            conversation,
            model: ModelSpec {
                name: model.name.clone(),
                provider: model
                    .provider
                    .clone()
                    .unwrap_or_else(|| PROVIDER_NOT_FOUND.to_string()),
                key: resolve_api_key(&self.settings, &model.name),
            },
            web_search: self.settings.web_search,
            tavily_api_key: self.settings.tavily_api_key.clone(),
        }
    }

    async fn discard_chat(&mut self, chat_id: &str) {
        match self.store.delete_chat(chat_id).await {
            Ok(_) => {
                if self.chat_id.as_deref() == Some(chat_id) {
                    self.chat_id = None;
                }
            }
            Err(e) => warn!(chat_id = %chat_id, error = %e, "failed to discard empty chat"),
        }
    }

    fn fail(&mut self, err: ChatError) -> SendOutcome {
        self.transition(SessionState::Erroring);
        warn!(error = %err, "send failed");
        SendOutcome::Failed(err)
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "session state");
        self.state = next;
    }
}

/// Entries the backend would drop anyway.
fn is_sendable(content: &str) -> bool {
    let trimmed = content.trim();
    !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case("undefined")
}
