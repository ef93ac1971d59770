// Merges the out-of-band realtime feed into the open conversation's store.
// The feed may duplicate or race the historical fetch; every path here is
// idempotent on message id.

use log::debug;

use super::reconcile::EchoMatchPolicy;
use super::store::MessageStore;
use crate::models::{Message, MessageId, MessageUpdate, RealtimeEvent};

/// What a single realtime event did to the store; drives UI notifications.
#[derive(Debug, Clone)]
pub enum Applied {
    Appended(Message),
    /// An echo was reconciled onto the optimistic entry `local_id`.
    Replaced {
        local_id: MessageId,
        message: Message,
    },
    Updated(Message),
    Removed(MessageId),
    Ignored,
}

pub struct RealtimeIngestor {
    policy: EchoMatchPolicy,
}

impl RealtimeIngestor {
    pub fn new(policy: EchoMatchPolicy) -> Self {
        RealtimeIngestor { policy }
    }

    /// Apply one feed event. Inserts of our own messages are first offered
    /// to the echo matcher. Updates merge only the fields the event
    /// carries. Events for unknown ids are dropped; the row will be there
    /// on the next full fetch.
    pub fn apply(&self, store: &mut MessageStore, event: RealtimeEvent) -> Applied {
        match event {
            RealtimeEvent::Insert(msg) => self.apply_insert(store, msg),
            RealtimeEvent::Update(update) => apply_update(store, update),
            RealtimeEvent::Delete(id) => match store.remove(&id) {
                Some(_) => Applied::Removed(id),
                None => {
                    debug!("realtime delete for unknown id {}", id);
                    Applied::Ignored
                }
            },
        }
    }

    fn apply_insert(&self, store: &mut MessageStore, msg: Message) -> Applied {
        if store.contains(&msg.id) {
            debug!("realtime insert for {} already present", msg.id);
            return Applied::Ignored;
        }
        if msg.from_me {
            if let Some(local_id) = self.policy.find_echo(store, &msg) {
                store.replace(&local_id, msg.clone());
                return Applied::Replaced {
                    local_id,
                    message: msg,
                };
            }
            // Either a send from another device or an echo that slid out of
            // the scan window; both land as a plain append.
            debug!("no optimistic match for own message {}", msg.id);
        }
        store.append(msg.clone());
        Applied::Appended(msg)
    }
}

fn apply_update(store: &mut MessageStore, update: MessageUpdate) -> Applied {
    let MessageUpdate {
        id,
        status,
        content,
        media_url,
    } = update;
    if !store.contains(&id) {
        debug!("realtime update for unknown id {}; dropping", id);
        return Applied::Ignored;
    }
    let updated = store.modify(&id, |m| {
        if let Some(status) = status {
            if m.status.can_advance_to(status) {
                m.status = status;
            } else {
                debug!("ignoring status regression {:?} -> {:?} on {}", m.status, status, m.id);
            }
        }
        if let Some(content) = content {
            m.content = Some(content);
        }
        if let Some(url) = media_url {
            m.media_url = Some(url);
        }
    });
    match updated {
        Some(m) => Applied::Updated(m),
        None => Applied::Ignored,
    }
}
