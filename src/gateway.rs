// Collaborator interfaces consumed by the messaging core. Concrete
// transports (HTTP backend, websocket feed, WhatsApp gateway) live in the
// embedding application; the core only ever sees these traits.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::{Message, RealtimeEvent, SendAck, SendPayload};

/// Errors surfaced by the external collaborators. Every variant is
/// retryable from the caller's point of view.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("gateway rejected the request: {0}")]
    Rejected(String),
}

/// Read access to the conversation history backing store.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Fetch up to `limit` messages of `conversation_id` strictly older than
    /// `before_timestamp` (exclusive), newest first. `None` means "from the
    /// latest".
    async fn fetch_page(
        &self,
        conversation_id: &str,
        before_timestamp: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Message>, NetworkError>;
}

/// Push feed of out-of-band changes to a conversation.
#[async_trait]
pub trait RealtimeFeed: Send + Sync {
    /// Subscribe to the conversation's event stream. Dropping the returned
    /// receiver is the unsubscribe.
    async fn subscribe(
        &self,
        conversation_id: &str,
    ) -> Result<mpsc::Receiver<RealtimeEvent>, NetworkError>;
}

/// The opaque outbound send RPC, used identically by the optimistic send
/// path and the broadcast dispatcher.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn send(
        &self,
        conversation_id: &str,
        payload: &SendPayload,
    ) -> Result<SendAck, NetworkError>;
}
