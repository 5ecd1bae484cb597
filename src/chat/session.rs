use super::notifier::StreamView;
use crate::db::models::{NewMessage, SourceMap};
use crate::llm::StreamPayload;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishCause {
    Completed,
    Cancelled,
}

/// Accumulated state of one in-flight reply.
#[derive(Debug)]
pub struct StreamSession {
    content: String,
    thinking: String,
    sources: Option<SourceMap>,
    send_start: Instant,
    first_payload_at: Option<Instant>,
    thinking_start: Option<Instant>,
    thinking_end: Option<Instant>,
}

/// What finalize hands to the store, before model/provider are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalReply {
    pub content: String,
    pub thinking: Option<String>,
    pub sources: Option<SourceMap>,
    pub duration: u64,
    pub thinking_duration: Option<u64>,
}

impl FinalReply {
    pub fn into_message(self, model: Option<String>, provider: Option<String>) -> NewMessage {
        NewMessage {
            thinking: self.thinking,
            sources: self.sources,
            duration: Some(self.duration),
            thinking_duration: self.thinking_duration,
            model,
            provider,
            ..NewMessage::assistant(self.content)
        }
    }
}

impl StreamSession {
    pub fn new(send_start: Instant) -> Self {
        Self {
            content: String::new(),
            thinking: String::new(),
            sources: None,
            send_start,
            first_payload_at: None,
            thinking_start: None,
            thinking_end: None,
        }
    }

    pub fn apply(&mut self, payload: &StreamPayload, now: Instant) {
        self.first_payload_at.get_or_insert(now);

        let content = payload.content.as_deref().unwrap_or_default();
        let thinking = payload.thinking.as_deref().unwrap_or_default();
        self.content.push_str(content);
        self.thinking.push_str(thinking);

        if !thinking.is_empty() && self.thinking_start.is_none() {
            self.thinking_start = Some(now);
        }
        // reasoning phase ends at the first answer fragment after it began
        if self.thinking_start.is_some() && self.thinking_end.is_none() && !content.is_empty() {
            self.thinking_end = Some(now);
        }

        if self.sources.is_none() {
            if let Some(sources) = payload.sources.as_ref().filter(|s| !s.is_empty()) {
                self.sources = Some(sources.clone());
            }
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn thinking(&self) -> &str {
        &self.thinking
    }

    pub fn sources(&self) -> Option<&SourceMap> {
        self.sources.as_ref()
    }

    pub fn view(&self, chat_id: &str, streaming: bool) -> StreamView {
        StreamView {
            chat_id: chat_id.to_string(),
            content: self.content.clone(),
            thinking: self.thinking.clone(),
            sources: self.sources.clone(),
            streaming,
        }
    }

    /// Generation time from the first frame (or from dispatch when no frame
    /// ever arrived), and reasoning time when a thinking phase was seen.
    pub fn durations(&self, now: Instant) -> (u64, Option<u64>) {
        let base = self.first_payload_at.unwrap_or(self.send_start);
        let duration = millis_between(base, now);
        let thinking_duration = self
            .thinking_start
            .map(|start| millis_between(start, self.thinking_end.unwrap_or(now)));
        (duration, thinking_duration)
    }

    /// Shared by normal completion and cancellation. A cancelled session with
    /// no content yields nothing to persist.
    pub fn finalize(self, cause: FinishCause, now: Instant) -> Option<FinalReply> {
        if cause == FinishCause::Cancelled && self.content.is_empty() {
            return None;
        }
        let (duration, thinking_duration) = self.durations(now);
        Some(FinalReply {
            content: self.content,
            thinking: (!self.thinking.is_empty()).then_some(self.thinking),
            sources: self.sources,
            duration,
            thinking_duration,
        })
    }
}

fn millis_between(start: Instant, end: Instant) -> u64 {
    end.saturating_duration_since(start).as_millis() as u64
}
