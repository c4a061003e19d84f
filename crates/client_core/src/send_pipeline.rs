//! Optimistic send: show a pending placeholder immediately, then either
//! promote it with the server's durable copy or roll it back.
//!
//! Every step matches the placeholder by its [`TempMessageId`]. Two sends with
//! identical text in flight at the same time therefore confirm and roll back
//! independently.

use shared::domain::{ConversationId, Message, TempMessageId, UserId};
use tracing::{debug, warn};

use crate::{
    error::{ChatError, ChatResult},
    reconciler::{ReconcileOrigin, Reconciled},
    ChatState,
};

/// Bookkeeping for one in-flight send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub temp_id: TempMessageId,
    pub conversation_id: ConversationId,
    /// Trimmed text sent to the server.
    pub content: String,
    /// Compose field exactly as the user left it.
    pub draft: String,
}

pub fn validate_content(content: &str) -> ChatResult<&str> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ChatError::Validation("message content is empty".to_string()));
    }
    Ok(trimmed)
}

impl ChatState {
    pub(crate) fn begin_send(
        &mut self,
        sender_id: &UserId,
        conversation_id: &ConversationId,
        draft: &str,
    ) -> ChatResult<PendingSend> {
        let content = validate_content(draft)?.to_string();
        if !self.conversations.contains(conversation_id) {
            return Err(ChatError::NotFound(format!(
                "conversation {conversation_id} does not exist"
            )));
        }

        let provisional =
            Message::provisional(conversation_id.clone(), sender_id.clone(), content.clone());
        let Some(temp_id) = provisional.temp_id() else {
            return Err(ChatError::Validation(
                "provisional message lacks a temporary id".to_string(),
            ));
        };
        if self
            .messages
            .reconcile(provisional, ReconcileOrigin::LocalAppend)
            .is_none()
        {
            debug!(%conversation_id, %temp_id, "sending to a conversation that is not open");
        }
        self.draft.clear();

        Ok(PendingSend {
            temp_id,
            conversation_id: conversation_id.clone(),
            content,
            draft: draft.to_string(),
        })
    }

    pub(crate) fn confirm_send(
        &mut self,
        pending: &PendingSend,
        durable: Message,
    ) -> Option<Reconciled> {
        if let Err(err) = self.conversations.record_last_message(&durable) {
            warn!(conversation_id = %pending.conversation_id, "confirmed send for unknown conversation: {err}");
        }
        self.messages.reconcile(
            durable,
            ReconcileOrigin::OwnSendConfirm {
                temp_id: pending.temp_id,
            },
        )
    }

    /// Removes the placeholder and puts the original draft back in the
    /// compose field.
    pub(crate) fn roll_back_send(&mut self, pending: PendingSend) -> Option<Message> {
        let removed = self.messages.remove_temporary(pending.temp_id);
        self.draft = pending.draft;
        removed
    }
}
