use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier for a message. Server ids are assigned by the backing store;
/// local ids are minted client-side for optimistic messages. The two kinds
/// live in separate namespaces, so a local id can never collide with a
/// server id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageId {
    Server(String),
    Local(String),
}

impl MessageId {
    /// Mint a fresh local id for an optimistic message.
    pub fn new_local() -> Self {
        MessageId::Local(uuid::Uuid::new_v4().to_string())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, MessageId::Local(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Server(id) => write!(f, "{}", id),
            MessageId::Local(id) => write!(f, "local:{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Text,
    Image,
    Audio,
    Video,
    Document,
    Contact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Pending = 0,   // Created locally, not yet acknowledged
    Sent = 1,      // Accepted by the gateway
    Delivered = 2, // Delivered to the recipient's device
    Read = 3,      // Read by the recipient
    Failed = 4,    // Send failed (terminal, reachable only from Pending)
}

impl MessageStatus {
    /// Whether moving to `next` respects the delivery ladder: statuses only
    /// advance, and `Failed` is reachable from `Pending` alone.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        match (self, next) {
            (MessageStatus::Pending, MessageStatus::Failed) => true,
            (_, MessageStatus::Failed) | (MessageStatus::Failed, _) => false,
            _ => (next as u8) > (self as u8),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: String,
    pub from_me: bool,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub status: MessageStatus,
    /// Unix milliseconds. Server-assigned once confirmed; the client clock
    /// at creation time for optimistic messages.
    pub timestamp: i64,
    /// Weak reference to a quoted message, resolved by store lookup.
    pub quoted_message_id: Option<MessageId>,
}

/// What the user asked the gateway to deliver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SendPayload {
    Text { body: String },
    Media { kind: MessageKind, url: String, caption: Option<String> },
    ContactCard { name: String, phone: String },
}

impl SendPayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            SendPayload::Text { .. } => MessageKind::Text,
            SendPayload::Media { kind, .. } => *kind,
            SendPayload::ContactCard { .. } => MessageKind::Contact,
        }
    }
}

/// The gateway's synchronous acknowledgement of a send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendAck {
    pub server_id: String,
    pub status: MessageStatus,
}

/// One event on a conversation's realtime feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RealtimeEvent {
    Insert(Message),
    Update(MessageUpdate),
    Delete(MessageId),
}

/// Partial update: only the carried fields are merged into the stored
/// record, the rest is kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageUpdate {
    pub id: MessageId,
    pub status: Option<MessageStatus>,
    pub content: Option<String>,
    pub media_url: Option<String>,
}
