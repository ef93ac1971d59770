// Common test utilities for the integration tests: logging setup, message
// builders and in-memory implementations of the three collaborator
// interfaces.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Once;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::LevelFilter;
use tokio::sync::{mpsc, Mutex};

use chatflow::gateway::{Gateway, HistoryStore, NetworkError, RealtimeFeed};
use chatflow::models::{
    Message, MessageId, MessageKind, MessageStatus, RealtimeEvent, SendAck, SendPayload,
};

// Initialize logging once per test binary
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

/// Build a confirmed incoming message with a server id.
pub fn server_message(conversation_id: &str, server_id: &str, timestamp: i64, body: &str) -> Message {
    Message {
        id: MessageId::Server(server_id.to_string()),
        conversation_id: conversation_id.to_string(),
        from_me: false,
        kind: MessageKind::Text,
        content: Some(body.to_string()),
        media_url: None,
        status: MessageStatus::Delivered,
        timestamp,
        quoted_message_id: None,
    }
}

/// Build the realtime echo of a message we sent ourselves.
pub fn own_echo(conversation_id: &str, server_id: &str, timestamp: i64, body: &str) -> Message {
    let mut msg = server_message(conversation_id, server_id, timestamp, body);
    msg.from_me = true;
    msg.status = MessageStatus::Sent;
    msg
}

/// An ascending timeline of `count` incoming messages, ids s1..sN,
/// timestamps 1000, 2000, ...
pub fn timeline(conversation_id: &str, count: usize) -> Vec<Message> {
    (0..count)
        .map(|i| {
            server_message(
                conversation_id,
                &format!("s{}", i + 1),
                1_000 + (i as i64) * 1_000,
                &format!("message {}", i + 1),
            )
        })
        .collect()
}

/// In-memory HistoryStore: a fixed timeline served newest-first in pages,
/// with optional per-conversation response delays and scripted failures.
pub struct MemoryHistory {
    messages: Mutex<Vec<Message>>,
    delays: Mutex<HashMap<String, u64>>,
    fail_next: AtomicBool,
    fetch_calls: AtomicUsize,
}

impl MemoryHistory {
    pub fn new(messages: Vec<Message>) -> Self {
        MemoryHistory {
            messages: Mutex::new(messages),
            delays: Mutex::new(HashMap::new()),
            fail_next: AtomicBool::new(false),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    /// Delay every fetch for `conversation_id` by `ms` before responding.
    pub async fn set_delay(&self, conversation_id: &str, ms: u64) {
        self.delays
            .lock()
            .await
            .insert(conversation_id.to_string(), ms);
    }

    /// Make the next fetch fail with a transport error.
    pub fn fail_next_fetch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn fetch_page(
        &self,
        conversation_id: &str,
        before_timestamp: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Message>, NetworkError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.delays.lock().await.get(conversation_id).copied();
        if let Some(ms) = delay {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(NetworkError::Transport("scripted history failure".to_string()));
        }

        let messages = self.messages.lock().await;
        let mut page: Vec<Message> = messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .filter(|m| before_timestamp.map_or(true, |ts| m.timestamp < ts))
            .cloned()
            .collect();
        page.sort_by_key(|m| std::cmp::Reverse(m.timestamp));
        page.truncate(limit);
        Ok(page)
    }
}

/// In-memory RealtimeFeed: tests push events through per-conversation
/// senders and can observe unsubscription (receiver dropped).
pub struct MemoryFeed {
    senders: Mutex<HashMap<String, mpsc::Sender<RealtimeEvent>>>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        MemoryFeed {
            senders: Mutex::new(HashMap::new()),
        }
    }

    /// Push an event into the subscribed conversation's stream.
    pub async fn push(&self, conversation_id: &str, event: RealtimeEvent) {
        let senders = self.senders.lock().await;
        let tx = senders
            .get(conversation_id)
            .expect("conversation was never subscribed");
        tx.send(event).await.expect("subscriber went away");
    }

    /// Whether the conversation still has a live subscriber.
    pub async fn is_subscribed(&self, conversation_id: &str) -> bool {
        let senders = self.senders.lock().await;
        senders
            .get(conversation_id)
            .map_or(false, |tx| !tx.is_closed())
    }
}

#[async_trait]
impl RealtimeFeed for MemoryFeed {
    async fn subscribe(
        &self,
        conversation_id: &str,
    ) -> Result<mpsc::Receiver<RealtimeEvent>, NetworkError> {
        let (tx, rx) = mpsc::channel(64);
        self.senders
            .lock()
            .await
            .insert(conversation_id.to_string(), tx);
        Ok(rx)
    }
}

/// What the gateway should do with the next send call.
pub enum SendScript {
    Ok { server_id: String },
    OkAfter { server_id: String, delay_ms: u64 },
    Fail { reason: String },
    /// Never resolves; the caller's timeout has to fire.
    Hang,
}

/// One recorded send call.
#[derive(Clone)]
pub struct SendCall {
    pub conversation_id: String,
    pub payload: SendPayload,
    pub at: Instant,
}

/// In-memory Gateway recording every call and answering from a script.
/// Unscripted calls succeed with a generated server id.
pub struct ScriptedGateway {
    script: Mutex<VecDeque<SendScript>>,
    calls: Mutex<Vec<SendCall>>,
    counter: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        ScriptedGateway {
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
        }
    }

    pub async fn push_script(&self, action: SendScript) {
        self.script.lock().await.push_back(action);
    }

    pub async fn calls(&self) -> Vec<SendCall> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }
}

#[async_trait]
impl Gateway for ScriptedGateway {
    async fn send(
        &self,
        conversation_id: &str,
        payload: &SendPayload,
    ) -> Result<SendAck, NetworkError> {
        self.calls.lock().await.push(SendCall {
            conversation_id: conversation_id.to_string(),
            payload: payload.clone(),
            at: Instant::now(),
        });

        let action = self.script.lock().await.pop_front();
        match action {
            Some(SendScript::Ok { server_id }) => Ok(SendAck {
                server_id,
                status: MessageStatus::Sent,
            }),
            Some(SendScript::OkAfter { server_id, delay_ms }) => {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(SendAck {
                    server_id,
                    status: MessageStatus::Sent,
                })
            }
            Some(SendScript::Fail { reason }) => Err(NetworkError::Rejected(reason)),
            Some(SendScript::Hang) => std::future::pending().await,
            None => {
                let n = self.counter.fetch_add(1, Ordering::SeqCst);
                Ok(SendAck {
                    server_id: format!("srv-{}", n),
                    status: MessageStatus::Sent,
                })
            }
        }
    }
}

/// Poll `predicate` until it holds or `timeout` elapses. Returns whether it
/// ever held.
pub async fn wait_until<F, Fut>(mut predicate: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if predicate().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the session snapshot reaches `len`.
pub async fn wait_for_len(
    session: &chatflow::ConversationSession,
    len: usize,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if session.snapshot().await.len() == len {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the feed's subscription state for `conversation_id` matches
/// `subscribed`.
pub async fn wait_subscribed(
    feed: &MemoryFeed,
    conversation_id: &str,
    subscribed: bool,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if feed.is_subscribed(conversation_id).await == subscribed {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
