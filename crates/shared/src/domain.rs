use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);

/// Client-generated placeholder identity. Never sent over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TempMessageId(Uuid);

impl TempMessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TempMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "temp-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Temporary(TempMessageId),
    Durable(MessageId),
}

impl MessageKey {
    pub fn durable(&self) -> Option<&MessageId> {
        match self {
            MessageKey::Durable(id) => Some(id),
            MessageKey::Temporary(_) => None,
        }
    }

    pub fn temporary(&self) -> Option<TempMessageId> {
        match self {
            MessageKey::Temporary(id) => Some(*id),
            MessageKey::Durable(_) => None,
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKey::Temporary(id) => id.fmt(f),
            MessageKey::Durable(id) => id.fmt(f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Farmer,
    Buyer,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub user_id: UserId,
    pub display_name: String,
    pub role: ParticipantRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participant_id: UserId,
    pub participant_display_name: String,
    pub participant_role: ParticipantRole,
    #[serde(default)]
    pub last_message_preview: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageKey,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    pub status: DeliveryStatus,
}

impl Message {
    /// Placeholder shown between a local send and its server confirmation.
    pub fn provisional(
        conversation_id: ConversationId,
        sender_id: UserId,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageKey::Temporary(TempMessageId::generate()),
            conversation_id,
            sender_id,
            content: content.into(),
            created_at: Utc::now(),
            is_read: false,
            status: DeliveryStatus::Pending,
        }
    }

    pub fn durable_id(&self) -> Option<&MessageId> {
        self.id.durable()
    }

    pub fn temp_id(&self) -> Option<TempMessageId> {
        self.id.temporary()
    }

    pub fn is_pending_temporary(&self) -> bool {
        self.status == DeliveryStatus::Pending && self.temp_id().is_some()
    }
}
