use std::collections::{HashSet, VecDeque};

use shared::domain::{ConversationId, Message, MessageId, UserId};
use tracing::trace;

use crate::{conversation_store::ConversationStore, error::ChatResult};

const COUNTED_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreadEffect {
    Unchanged,
    Incremented { unread_count: u32 },
    /// Count pinned to zero for the open conversation; the server should be told.
    MarkRead,
}

/// Keeps `unread_count` in step with viewing state. Counts only ever grow by
/// one per unseen incoming message or drop straight to zero on open/read.
#[derive(Debug)]
pub struct UnreadTracker {
    local_user: UserId,
    counted: VecDeque<MessageId>,
    counted_index: HashSet<MessageId>,
}

impl UnreadTracker {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            counted: VecDeque::with_capacity(COUNTED_CAPACITY),
            counted_index: HashSet::with_capacity(COUNTED_CAPACITY),
        }
    }

    pub fn mark_read(
        &self,
        store: &mut ConversationStore,
        conversation_id: &ConversationId,
    ) -> ChatResult<()> {
        store.update(conversation_id, |conversation| conversation.unread_count = 0)?;
        Ok(())
    }

    pub fn on_incoming(
        &mut self,
        store: &mut ConversationStore,
        message: &Message,
        open: Option<&ConversationId>,
    ) -> ChatResult<UnreadEffect> {
        store.record_last_message(message)?;

        if message.sender_id == self.local_user {
            return Ok(UnreadEffect::Unchanged);
        }

        // Both push channels may report the same insert.
        if let Some(id) = message.durable_id() {
            if !self.remember(id) {
                trace!(message_id = %id, "unread: message already seen");
                return Ok(UnreadEffect::Unchanged);
            }
        }

        if open == Some(&message.conversation_id) {
            self.mark_read(store, &message.conversation_id)?;
            return Ok(UnreadEffect::MarkRead);
        }

        let updated = store.update(&message.conversation_id, |conversation| {
            conversation.unread_count = conversation.unread_count.saturating_add(1);
        })?;
        Ok(UnreadEffect::Incremented {
            unread_count: updated.unread_count,
        })
    }

    fn remember(&mut self, id: &MessageId) -> bool {
        if self.counted_index.contains(id) {
            return false;
        }
        if self.counted.len() == COUNTED_CAPACITY {
            if let Some(evicted) = self.counted.pop_front() {
                self.counted_index.remove(&evicted);
            }
        }
        self.counted.push_back(id.clone());
        self.counted_index.insert(id.clone());
        true
    }
}
