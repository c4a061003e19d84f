use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::domain::{
    ConversationId, DeliveryStatus, Message, MessageId, MessageKey, UserId,
};

/// Durable message as the server stores and reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: MessageKey::Durable(row.id),
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            content: row.content,
            created_at: row.created_at,
            is_read: row.is_read,
            status: DeliveryStatus::Confirmed,
        }
    }
}

/// Raw conversation table row carried by push events. Participants are unordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: ConversationId,
    pub participant_a: UserId,
    pub participant_b: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
}

impl ConversationRow {
    pub fn involves(&self, user_id: &UserId) -> bool {
        &self.participant_a == user_id || &self.participant_b == user_id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadRequest {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartConversationRequest {
    pub user_id: UserId,
    pub participant_id: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushKind {
    Insert,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushTable {
    Messages,
    Conversations,
}

/// One row change delivered over the push channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEvent {
    pub kind: PushKind,
    pub table: PushTable,
    pub row: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushRecord {
    Message(MessageRow),
    Conversation(ConversationRow),
}

impl PushEvent {
    pub fn message(kind: PushKind, row: &MessageRow) -> serde_json::Result<Self> {
        Ok(Self {
            kind,
            table: PushTable::Messages,
            row: serde_json::to_value(row)?,
        })
    }

    pub fn conversation(kind: PushKind, row: &ConversationRow) -> serde_json::Result<Self> {
        Ok(Self {
            kind,
            table: PushTable::Conversations,
            row: serde_json::to_value(row)?,
        })
    }

    pub fn record(&self) -> serde_json::Result<PushRecord> {
        match self.table {
            PushTable::Messages => decode_row(&self.row).map(PushRecord::Message),
            PushTable::Conversations => decode_row(&self.row).map(PushRecord::Conversation),
        }
    }
}

fn decode_row<T: DeserializeOwned>(row: &serde_json::Value) -> serde_json::Result<T> {
    T::deserialize(row)
}

/// Predicate a push subscription is opened with. Sent as the first frame of a
/// realtime connection and re-checked by the client on every delivered record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriptionFilter {
    Conversation { conversation_id: ConversationId },
    Participant { user_id: UserId },
}

impl SubscriptionFilter {
    pub fn matches(&self, record: &PushRecord) -> bool {
        match (self, record) {
            (SubscriptionFilter::Conversation { conversation_id }, PushRecord::Message(row)) => {
                &row.conversation_id == conversation_id
            }
            (SubscriptionFilter::Conversation { .. }, PushRecord::Conversation(_)) => false,
            (SubscriptionFilter::Participant { user_id }, PushRecord::Conversation(row)) => {
                row.involves(user_id)
            }
            (SubscriptionFilter::Participant { user_id }, PushRecord::Message(row)) => {
                &row.sender_id == user_id || row.recipient_id.as_ref() == Some(user_id)
            }
        }
    }
}
