use super::{ChatError, ChatSession, SendOutcome};
use crate::db::models::{Chat, ChatMessage, Role};
use crate::db::ChatStore;
use crate::llm::ChatTransport;
use tracing::{debug, info, warn};

impl<S, T> ChatSession<S, T>
where
    S: ChatStore,
    T: ChatTransport,
{
    /// Drops `message_id` and everything after it, then sends `new_content`
    /// as a fresh user turn.
    ///
    /// If the resend never reaches the store (blank content is rejected
    /// before truncating), the original history is restored.
    pub async fn edit_and_resend(
        &mut self,
        message_id: &str,
        new_content: &str,
    ) -> Result<SendOutcome, ChatError> {
        let mut chat = self.current_chat().await.inspect_err(log_skip)?;
        let index = chat
            .position_of(message_id)
            .ok_or_else(|| ChatError::not_found("message", message_id))
            .inspect_err(log_skip)?;
        if new_content.trim().is_empty() {
            debug!("ignoring blank edit");
            return Ok(SendOutcome::Ignored);
        }

        self.stop_inference();
        let original = chat.messages.clone();
        chat.messages.truncate(index);
        let kept = chat.messages.len();
        self.store.update_chat(&chat).await.inspect_err(|e| {
            warn!(chat_id = %chat.id, error = %e, "failed to persist truncated history")
        })?;
        info!(chat_id = %chat.id, kept, dropped = original.len() - kept, "history truncated for edit");

        let outcome = self.send_message(new_content).await;
        if matches!(outcome, SendOutcome::Ignored | SendOutcome::Failed(_)) {
            self.reconcile_truncation(&chat, kept, original).await;
        }
        Ok(outcome)
    }

    /// Removes a message together with its partner turn: the assistant reply
    /// following a user message, or the user message preceding a reply.
    pub async fn delete_pair(&mut self, message_id: &str) -> Result<Chat, ChatError> {
        let mut chat = self.current_chat().await.inspect_err(log_skip)?;
        let index = chat
            .position_of(message_id)
            .ok_or_else(|| ChatError::not_found("message", message_id))
            .inspect_err(log_skip)?;

        let doomed = paired_indices(&chat.messages, index);
        let mut position = 0;
        chat.messages.retain(|_| {
            let keep = !doomed.contains(&position);
            position += 1;
            keep
        });

        let chat = self.store.update_chat(&chat).await.inspect_err(|e| {
            warn!(chat_id = %chat.id, error = %e, "failed to persist deletion")
        })?;
        debug!(chat_id = %chat.id, removed = doomed.len(), "message pair deleted");
        if let Err(e) = self.refresh_chats().await {
            warn!(error = %e, "failed to refresh chat list");
        }
        Ok(chat)
    }

    /// Puts the pre-edit history back when the store still holds only the
    /// truncated prefix, i.e. the resend never appended its user turn.
    async fn reconcile_truncation(&mut self, truncated: &Chat, kept: usize, original: Vec<ChatMessage>) {
        let current = match self.store.get_chat_by_id(&truncated.id).await {
            Ok(Some(chat)) => chat,
            Ok(None) => return,
            Err(e) => {
                warn!(chat_id = %truncated.id, error = %e, "cannot reconcile edited history");
                return;
            }
        };
        if current.messages.len() != kept {
            return;
        }

        let restored = Chat {
            messages: original,
            ..current
        };
        match self.store.update_chat(&restored).await {
            Ok(_) => info!(chat_id = %restored.id, "resend failed; original history restored"),
            Err(e) => warn!(chat_id = %restored.id, error = %e, "failed to restore edited history"),
        }
        if let Err(e) = self.refresh_chats().await {
            warn!(error = %e, "failed to refresh chat list");
        }
    }
}

/// Indices removed by a paired delete of `messages[index]`.
fn paired_indices(messages: &[ChatMessage], index: usize) -> Vec<usize> {
    let mut doomed = vec![index];
    match messages[index].role {
        Role::User => {
            if messages
                .get(index + 1)
                .is_some_and(|m| m.role == Role::Assistant)
            {
                doomed.push(index + 1);
            }
        }
        Role::Assistant => {
            if index > 0 && messages[index - 1].role == Role::User {
                doomed.push(index - 1);
            }
        }
        Role::System => {}
    }
    doomed
}

fn log_skip(err: &ChatError) {
    warn!(error = %err, "history edit skipped");
}
