use std::collections::HashMap;

use shared::domain::{Conversation, ConversationId, Message, UserId};
use tracing::debug;

use crate::error::{ChatError, ChatResult};

/// Conversation metadata keyed by id. Every mutation replaces the whole record.
#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: HashMap<ConversationId, Conversation>,
    issued_generation: u64,
    applied_generation: u64,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags a list refresh about to be requested.
    pub fn begin_refresh(&mut self) -> u64 {
        self.issued_generation += 1;
        self.issued_generation
    }

    /// Replaces the table with a refresh result unless a newer refresh has
    /// already been applied. Unread counts are taken verbatim from the server.
    pub fn apply_refresh(&mut self, generation: u64, conversations: Vec<Conversation>) -> bool {
        if generation < self.applied_generation {
            debug!(
                generation,
                applied = self.applied_generation,
                "discarding out-of-date conversation list"
            );
            return false;
        }
        self.applied_generation = generation;
        self.replace_all(conversations);
        true
    }

    pub fn replace_all(&mut self, conversations: Vec<Conversation>) {
        self.conversations = conversations
            .into_iter()
            .map(|conversation| (conversation.id.clone(), conversation))
            .collect();
    }

    pub fn upsert(&mut self, conversation: Conversation) {
        self.conversations
            .insert(conversation.id.clone(), conversation);
    }

    pub fn get(&self, conversation_id: &ConversationId) -> Option<&Conversation> {
        self.conversations.get(conversation_id)
    }

    pub fn contains(&self, conversation_id: &ConversationId) -> bool {
        self.conversations.contains_key(conversation_id)
    }

    pub fn find_by_participant(&self, participant_id: &UserId) -> Option<&Conversation> {
        self.conversations
            .values()
            .find(|conversation| &conversation.participant_id == participant_id)
    }

    /// Copies the record, applies `edit`, and stores the copy back.
    pub fn update<F>(&mut self, conversation_id: &ConversationId, edit: F) -> ChatResult<Conversation>
    where
        F: FnOnce(&mut Conversation),
    {
        let mut next = self
            .conversations
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| ChatError::NotFound(format!("conversation {conversation_id}")))?;
        edit(&mut next);
        self.conversations
            .insert(conversation_id.clone(), next.clone());
        Ok(next)
    }

    /// Moves the preview forward to `message` unless a newer one is already shown.
    pub fn record_last_message(&mut self, message: &Message) -> ChatResult<Conversation> {
        self.update(&message.conversation_id, |conversation| {
            let newer = conversation
                .last_message_at
                .map_or(true, |shown| shown <= message.created_at);
            if newer {
                conversation.last_message_preview = Some(message.content.clone());
                conversation.last_message_at = Some(message.created_at);
            }
        })
    }

    /// Most recently active first; conversations without messages last.
    pub fn list(&self) -> Vec<Conversation> {
        let mut conversations: Vec<Conversation> = self.conversations.values().cloned().collect();
        conversations.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        conversations
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}
