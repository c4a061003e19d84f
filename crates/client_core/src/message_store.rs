use shared::domain::{ConversationId, Message, TempMessageId, UserId};
use tracing::debug;

use crate::reconciler::{remove_temporary, MessageReconciler, ReconcileOrigin, Reconciled};

/// Identifies the selection a bulk fetch was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    conversation_id: ConversationId,
    epoch: u64,
}

impl FetchTicket {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }
}

/// Ordered messages of the currently open conversation.
#[derive(Debug)]
pub struct MessageStore {
    reconciler: MessageReconciler,
    open: Option<ConversationId>,
    epoch: u64,
    messages: Vec<Message>,
}

impl MessageStore {
    pub fn new(local_user: UserId) -> Self {
        Self {
            reconciler: MessageReconciler::new(local_user),
            open: None,
            epoch: 0,
            messages: Vec::new(),
        }
    }

    /// Selects `conversation_id`. Any ticket issued before this call goes stale.
    pub fn open(&mut self, conversation_id: ConversationId) -> FetchTicket {
        if self.open.as_ref() != Some(&conversation_id) {
            self.messages.clear();
        }
        self.epoch += 1;
        self.open = Some(conversation_id.clone());
        FetchTicket {
            conversation_id,
            epoch: self.epoch,
        }
    }

    pub fn close(&mut self) {
        self.epoch += 1;
        self.open = None;
        self.messages.clear();
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.open.as_ref()
    }

    pub fn is_open(&self, conversation_id: &ConversationId) -> bool {
        self.open.as_ref() == Some(conversation_id)
    }

    pub fn is_current(&self, ticket: &FetchTicket) -> bool {
        ticket.epoch == self.epoch && self.is_open(&ticket.conversation_id)
    }

    /// Applies a bulk fetch if its ticket still names the current selection.
    /// Returns `false` when the result was discarded as stale.
    pub fn apply_fetch(&mut self, ticket: &FetchTicket, fetched: Vec<Message>) -> bool {
        if !self.is_current(ticket) {
            debug!(
                conversation_id = %ticket.conversation_id,
                "discarding stale message fetch"
            );
            return false;
        }
        let current = std::mem::take(&mut self.messages);
        self.messages = self.reconciler.rebase(current, fetched);
        true
    }

    /// Reconciles `incoming` into the open sequence. Messages for any other
    /// conversation are ignored and `None` is returned.
    pub fn reconcile(&mut self, incoming: Message, origin: ReconcileOrigin) -> Option<Reconciled> {
        if !self.is_open(&incoming.conversation_id) {
            debug!(
                conversation_id = %incoming.conversation_id,
                ?origin,
                "ignoring message for a conversation that is not open"
            );
            return None;
        }
        Some(
            self.reconciler
                .reconcile(&mut self.messages, incoming, origin),
        )
    }

    pub fn remove_temporary(&mut self, temp_id: TempMessageId) -> Option<Message> {
        remove_temporary(&mut self.messages, temp_id)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
