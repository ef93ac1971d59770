// Optimistic send bookkeeping: a just-sent message is shown immediately,
// then replaced in place by its confirmed counterpart exactly once,
// whichever of the gateway ack and the realtime echo lands first.

use chrono::Utc;
use log::debug;

use super::store::MessageStore;
use crate::models::{Message, MessageId, MessageKind, MessageStatus, SendAck, SendPayload};

/// Default number of recent entries the echo matcher examines.
pub const DEFAULT_ECHO_SCAN_WINDOW: usize = 8;

/// Tunable heuristic for matching a realtime echo to an optimistic entry.
/// Only the most recent `scan_window` entries are examined; the bound keeps
/// the scan cheap and avoids false positives against older messages that
/// happen to carry identical text.
#[derive(Debug, Clone, Copy)]
pub struct EchoMatchPolicy {
    pub scan_window: usize,
}

impl Default for EchoMatchPolicy {
    fn default() -> Self {
        EchoMatchPolicy {
            scan_window: DEFAULT_ECHO_SCAN_WINDOW,
        }
    }
}

impl EchoMatchPolicy {
    /// Find the optimistic entry a `from_me` realtime insert plausibly
    /// corresponds to: an unconfirmed local entry of the same kind, with
    /// identical content for text. Returns its local id.
    pub fn find_echo(&self, store: &MessageStore, incoming: &Message) -> Option<MessageId> {
        if !incoming.from_me {
            return None;
        }
        store
            .messages()
            .iter()
            .rev()
            .take(self.scan_window)
            .find(|existing| {
                existing.id.is_local()
                    && existing.from_me
                    && existing.kind == incoming.kind
                    && (incoming.kind != MessageKind::Text
                        || existing.content == incoming.content)
            })
            .map(|m| m.id.clone())
    }
}

/// Synthesize the provisional message appended the instant the user hits
/// send.
pub fn optimistic_message(
    conversation_id: &str,
    payload: &SendPayload,
    quoted: Option<MessageId>,
) -> Message {
    let (content, media_url) = match payload {
        SendPayload::Text { body } => (Some(body.clone()), None),
        SendPayload::Media { url, caption, .. } => (caption.clone(), Some(url.clone())),
        SendPayload::ContactCard { name, .. } => (Some(name.clone()), None),
    };
    Message {
        id: MessageId::new_local(),
        conversation_id: conversation_id.to_string(),
        from_me: true,
        kind: payload.kind(),
        content,
        media_url,
        status: MessageStatus::Pending,
        timestamp: Utc::now().timestamp_millis(),
        quoted_message_id: quoted,
    }
}

/// Fold the gateway's synchronous ack into the store. The optimistic entry
/// adopts the server id and status in place. When the realtime echo already
/// replaced it, only the status is merged onto the confirmed row; nothing is
/// ever re-inserted. Returns the updated record, if any.
pub fn apply_ack(store: &mut MessageStore, local_id: &MessageId, ack: &SendAck) -> Option<Message> {
    if let Some(existing) = store.get(local_id) {
        let mut confirmed = existing.clone();
        confirmed.id = MessageId::Server(ack.server_id.clone());
        if confirmed.status.can_advance_to(ack.status) {
            confirmed.status = ack.status;
        }
        store.replace(local_id, confirmed.clone());
        return Some(confirmed);
    }

    let server_id = MessageId::Server(ack.server_id.clone());
    if store.contains(&server_id) {
        debug!("ack for {} arrived after its echo; merging status only", server_id);
        return store.modify(&server_id, |m| {
            if m.status.can_advance_to(ack.status) {
                m.status = ack.status;
            }
        });
    }

    debug!("ack for {} matched nothing in the store", server_id);
    None
}

/// Mark a pending optimistic entry failed, in place. The entry is kept so
/// the user can retry or copy the text back out.
pub fn mark_failed(store: &mut MessageStore, local_id: &MessageId) -> Option<Message> {
    store.modify(local_id, |m| {
        if m.status.can_advance_to(MessageStatus::Failed) {
            m.status = MessageStatus::Failed;
        }
    })
}
