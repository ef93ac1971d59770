// Conversation messaging core for a WhatsApp-based CRM inbox: keeps the
// per-conversation message list consistent across historical fetches,
// realtime events and optimistic sends, and drives throttled outbound
// broadcasts.

pub mod broadcast;
pub mod gateway;
pub mod models;
pub mod session;

// Re-export main types for convenience
pub use models::*;
pub use session::{
    ConversationSession, SessionConfig, SessionError, SessionEvent, SessionState,
};
