// Conversation session orchestration: lifecycle, history pagination,
// realtime ingestion and optimistic sends for the currently open
// conversation. One session instance serves whichever conversation the UI
// has open; opening a new one tears the previous one down first.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, info};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;

use crate::gateway::{Gateway, HistoryStore, NetworkError, RealtimeFeed};
use crate::models::{Message, MessageId, MessageStatus, RealtimeEvent, SendPayload};

pub mod realtime;
pub mod reconcile;
pub mod store;

pub use realtime::{Applied, RealtimeIngestor};
pub use reconcile::{EchoMatchPolicy, DEFAULT_ECHO_SCAN_WINDOW};
pub use store::{FetchState, MessageStore, PaginationCursor};

use reconcile::{apply_ack, mark_failed, optimistic_message};

/// Default number of messages per history page.
pub const DEFAULT_PAGE_SIZE: usize = 20;
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(15);

/// Session tunables. `Default` matches production; `from_env` lets a
/// deployment override them without code changes.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub page_size: usize,
    pub fetch_timeout: Duration,
    pub send_timeout: Duration,
    pub echo_policy: EchoMatchPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            page_size: DEFAULT_PAGE_SIZE,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            echo_policy: EchoMatchPolicy::default(),
        }
    }
}

impl SessionConfig {
    /// Environment overrides: CHATFLOW_PAGE_SIZE, CHATFLOW_FETCH_TIMEOUT_MS,
    /// CHATFLOW_SEND_TIMEOUT_MS, CHATFLOW_ECHO_WINDOW.
    pub fn from_env() -> Self {
        let mut config = SessionConfig::default();
        if let Some(n) = env_parse::<usize>("CHATFLOW_PAGE_SIZE") {
            config.page_size = n;
        }
        if let Some(ms) = env_parse::<u64>("CHATFLOW_FETCH_TIMEOUT_MS") {
            config.fetch_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("CHATFLOW_SEND_TIMEOUT_MS") {
            config.send_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<usize>("CHATFLOW_ECHO_WINDOW") {
            config.echo_policy.scan_window = n;
        }
        config
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

/// Session lifecycle. Re-entrant: `open` while Open tears down first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Open,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no conversation is open")]
    NotOpen,

    #[error("message {0} not found or not retryable")]
    NotRetryable(MessageId),

    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// Store change notifications delivered to the UI layer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The initial page landed and the snapshot was (re)built.
    HistoryLoaded {
        conversation_id: String,
        count: usize,
        has_more: bool,
    },
    /// An older page was prepended.
    OlderLoaded { count: usize, has_more: bool },
    MessageAppended(Message),
    MessageUpdated(Message),
    MessageRemoved(MessageId),
    SendFailed { id: MessageId, reason: String },
}

struct SessionInner {
    state: SessionState,
    conversation_id: Option<String>,
    /// Bumped on every open/close. Async completions compare their captured
    /// epoch before touching the store; a mismatch is a stale response and
    /// is discarded.
    epoch: u64,
    store: MessageStore,
    cursor: PaginationCursor,
    /// Payloads of in-flight and failed optimistic sends, keyed by local
    /// id, kept so a failed send can be retried as-is.
    pending_sends: HashMap<MessageId, SendPayload>,
    ingest_task: Option<JoinHandle<()>>,
}

impl SessionInner {
    fn new() -> Self {
        SessionInner {
            state: SessionState::Closed,
            conversation_id: None,
            epoch: 0,
            store: MessageStore::new(),
            cursor: PaginationCursor::new(),
            pending_sends: HashMap::new(),
            ingest_task: None,
        }
    }
}

/// Discard everything belonging to the current conversation. Aborting the
/// ingest task drops the feed receiver, which is the unsubscribe.
fn teardown(inner: &mut SessionInner) {
    if let Some(task) = inner.ingest_task.take() {
        task.abort();
    }
    inner.store.reset();
    inner.cursor.reset();
    inner.pending_sends.clear();
    inner.conversation_id = None;
    inner.state = SessionState::Closed;
    inner.epoch += 1;
}

/// Owns the message state of the currently open conversation and
/// coordinates the three writers into it: historical fetch, realtime feed
/// and optimistic sends.
pub struct ConversationSession {
    history: Arc<dyn HistoryStore>,
    feed: Arc<dyn RealtimeFeed>,
    gateway: Arc<dyn Gateway>,
    config: SessionConfig,
    inner: Arc<TokioMutex<SessionInner>>,
    event_tx: mpsc::Sender<SessionEvent>,
}

impl ConversationSession {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        feed: Arc<dyn RealtimeFeed>,
        gateway: Arc<dyn Gateway>,
        config: SessionConfig,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (event_tx, event_rx) = mpsc::channel(100);
        let session = ConversationSession {
            history,
            feed,
            gateway,
            config,
            inner: Arc::new(TokioMutex::new(SessionInner::new())),
            event_tx,
        };
        (session, event_rx)
    }

    /// Open `conversation_id`, tearing down whatever was open before. The
    /// realtime subscription is live before the initial page is fetched, so
    /// the two may race; the store dedups by id either way.
    pub async fn open(&self, conversation_id: &str) -> Result<(), SessionError> {
        let epoch = {
            let mut inner = self.inner.lock().await;
            teardown(&mut inner);
            inner.state = SessionState::Opening;
            inner.conversation_id = Some(conversation_id.to_string());
            inner.epoch
        };
        info!("opening conversation {}", conversation_id);

        let events = match self.feed.subscribe(conversation_id).await {
            Ok(rx) => rx,
            Err(e) => {
                let mut inner = self.inner.lock().await;
                if inner.epoch == epoch {
                    inner.state = SessionState::Closed;
                    inner.conversation_id = None;
                }
                return Err(e.into());
            }
        };

        let task = self.spawn_ingest(events, epoch);
        {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                // A newer open() won the race; it owns the session now.
                debug!("open({}) superseded before ingest start", conversation_id);
                task.abort();
                return Ok(());
            }
            inner.ingest_task = Some(task);
        }

        self.load_initial(conversation_id, epoch).await?;

        let mut inner = self.inner.lock().await;
        if inner.epoch == epoch && inner.state == SessionState::Opening {
            inner.state = SessionState::Open;
        }
        Ok(())
    }

    /// Close the open conversation, if any. Unsubscribes the realtime feed
    /// and discards the store and cursor.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return;
        }
        info!("closing conversation {:?}", inner.conversation_id);
        teardown(&mut inner);
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn conversation_id(&self) -> Option<String> {
        self.inner.lock().await.conversation_id.clone()
    }

    /// Ordered view of the open conversation, ascending by timestamp.
    pub async fn snapshot(&self) -> Vec<Message> {
        self.inner.lock().await.store.snapshot()
    }

    pub async fn has_more_history(&self) -> bool {
        self.inner.lock().await.cursor.has_more()
    }

    /// Resolve a quoted-message reference against the loaded window. Weak
    /// reference: `None` when the quoted message is not loaded.
    pub async fn resolve_quoted(&self, id: &MessageId) -> Option<Message> {
        self.inner.lock().await.store.get(id).cloned()
    }

    /// Fetch the next page of history strictly older than the oldest loaded
    /// message. No-op (Ok(0)) when a load is already in flight or history
    /// is exhausted. Returns how many messages were prepended.
    pub async fn load_older(&self) -> Result<usize, SessionError> {
        let (conversation_id, before, epoch) = {
            let mut inner = self.inner.lock().await;
            if inner.state != SessionState::Open {
                return Err(SessionError::NotOpen);
            }
            let conversation_id = inner.conversation_id.clone().ok_or(SessionError::NotOpen)?;
            if !inner.cursor.begin_fetch() {
                debug!("load_older: already loading or history exhausted");
                return Ok(0);
            }
            (conversation_id, inner.cursor.oldest_loaded(), inner.epoch)
        };

        let result = self.fetch_page(&conversation_id, before).await;

        let (inserted, event) = {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                debug!("discarding stale older page for {}", conversation_id);
                return Ok(0);
            }
            match result {
                Ok(mut batch) => {
                    batch.reverse(); // newest-first from the store -> ascending
                    let fetched = batch.len();
                    let page_oldest = batch.first().map(|m| m.timestamp);
                    let inserted = inner.store.prepend(batch);
                    inner
                        .cursor
                        .finish_page(page_oldest, fetched, self.config.page_size);
                    let event = SessionEvent::OlderLoaded {
                        count: inserted,
                        has_more: inner.cursor.has_more(),
                    };
                    (inserted, event)
                }
                Err(e) => {
                    inner.cursor.fail_fetch();
                    return Err(e.into());
                }
            }
        };
        self.emit(event).await;
        Ok(inserted)
    }

    /// Append an optimistic entry and issue the send RPC. The returned id
    /// is the provisional local id; reconciliation later swaps the record
    /// for the confirmed one in place.
    pub async fn send(&self, payload: SendPayload) -> Result<MessageId, SessionError> {
        self.send_quoting(payload, None).await
    }

    pub async fn send_quoting(
        &self,
        payload: SendPayload,
        quoted: Option<MessageId>,
    ) -> Result<MessageId, SessionError> {
        let (conversation_id, msg, epoch) = {
            let mut inner = self.inner.lock().await;
            if inner.state != SessionState::Open {
                return Err(SessionError::NotOpen);
            }
            let conversation_id = inner.conversation_id.clone().ok_or(SessionError::NotOpen)?;
            let msg = optimistic_message(&conversation_id, &payload, quoted);
            inner.store.append(msg.clone());
            inner.pending_sends.insert(msg.id.clone(), payload.clone());
            (conversation_id, msg, inner.epoch)
        };
        self.emit(SessionEvent::MessageAppended(msg.clone())).await;

        let local_id = msg.id.clone();
        self.dispatch_send(&conversation_id, &payload, local_id.clone(), epoch)
            .await?;
        Ok(local_id)
    }

    /// Re-send a message whose optimistic send failed. The entry goes back
    /// to Pending in place and runs the normal reconciliation path.
    pub async fn retry_send(&self, id: &MessageId) -> Result<(), SessionError> {
        let (conversation_id, payload, updated, epoch) = {
            let mut inner = self.inner.lock().await;
            if inner.state != SessionState::Open {
                return Err(SessionError::NotOpen);
            }
            let conversation_id = inner.conversation_id.clone().ok_or(SessionError::NotOpen)?;
            let retryable = inner
                .store
                .get(id)
                .map(|m| m.id.is_local() && m.status == MessageStatus::Failed)
                .unwrap_or(false);
            if !retryable {
                return Err(SessionError::NotRetryable(id.clone()));
            }
            let Some(payload) = inner.pending_sends.get(id).cloned() else {
                return Err(SessionError::NotRetryable(id.clone()));
            };
            let updated = inner
                .store
                .modify(id, |m| m.status = MessageStatus::Pending);
            (conversation_id, payload, updated, inner.epoch)
        };
        if let Some(m) = updated {
            self.emit(SessionEvent::MessageUpdated(m)).await;
        }
        self.dispatch_send(&conversation_id, &payload, id.clone(), epoch)
            .await
    }

    /// Shared ack/failure path for first sends and retries. Stale
    /// completions (conversation switched while the RPC was in flight) are
    /// discarded silently.
    async fn dispatch_send(
        &self,
        conversation_id: &str,
        payload: &SendPayload,
        local_id: MessageId,
        epoch: u64,
    ) -> Result<(), SessionError> {
        let result = match timeout(
            self.config.send_timeout,
            self.gateway.send(conversation_id, payload),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(NetworkError::Timeout(self.config.send_timeout)),
        };

        match result {
            Ok(ack) => {
                let updated = {
                    let mut inner = self.inner.lock().await;
                    if inner.epoch != epoch {
                        debug!("discarding stale send ack for {}", local_id);
                        return Ok(());
                    }
                    inner.pending_sends.remove(&local_id);
                    apply_ack(&mut inner.store, &local_id, &ack)
                };
                if let Some(m) = updated {
                    self.emit(SessionEvent::MessageUpdated(m)).await;
                }
                Ok(())
            }
            Err(e) => {
                let failed = {
                    let mut inner = self.inner.lock().await;
                    if inner.epoch != epoch {
                        debug!("discarding stale send failure for {}", local_id);
                        return Ok(());
                    }
                    // The payload stays in pending_sends for retry_send.
                    mark_failed(&mut inner.store, &local_id)
                };
                if let Some(m) = failed {
                    self.emit(SessionEvent::SendFailed {
                        id: m.id.clone(),
                        reason: e.to_string(),
                    })
                    .await;
                }
                Err(e.into())
            }
        }
    }

    async fn load_initial(&self, conversation_id: &str, epoch: u64) -> Result<(), SessionError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch || !inner.cursor.begin_fetch() {
                return Ok(());
            }
        }

        let result = self.fetch_page(conversation_id, None).await;

        let event = {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                debug!("discarding stale initial page for {}", conversation_id);
                return Ok(());
            }
            match result {
                Ok(mut batch) => {
                    batch.reverse();
                    let fetched = batch.len();
                    let page_oldest = batch.first().map(|m| m.timestamp);
                    // Realtime inserts may already have landed while the
                    // fetch was in flight; prepend dedups against them.
                    inner.store.prepend(batch);
                    inner
                        .cursor
                        .finish_page(page_oldest, fetched, self.config.page_size);
                    SessionEvent::HistoryLoaded {
                        conversation_id: conversation_id.to_string(),
                        count: fetched,
                        has_more: inner.cursor.has_more(),
                    }
                }
                Err(e) => {
                    inner.cursor.fail_fetch();
                    return Err(e.into());
                }
            }
        };
        self.emit(event).await;
        Ok(())
    }

    async fn fetch_page(
        &self,
        conversation_id: &str,
        before: Option<i64>,
    ) -> Result<Vec<Message>, NetworkError> {
        match timeout(
            self.config.fetch_timeout,
            self.history
                .fetch_page(conversation_id, before, self.config.page_size),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout(self.config.fetch_timeout)),
        }
    }

    /// Ingest loop for one open conversation. Runs until the feed closes,
    /// the epoch moves on, or the task is aborted by teardown.
    fn spawn_ingest(&self, events: mpsc::Receiver<RealtimeEvent>, epoch: u64) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let event_tx = self.event_tx.clone();
        let ingestor = RealtimeIngestor::new(self.config.echo_policy);
        tokio::spawn(async move {
            let mut events = ReceiverStream::new(events);
            while let Some(event) = events.next().await {
                let applied = {
                    let mut guard = inner.lock().await;
                    if guard.epoch != epoch {
                        debug!("realtime event after conversation switch; stopping ingest");
                        break;
                    }
                    let applied = ingestor.apply(&mut guard.store, event);
                    if let Applied::Replaced { local_id, .. } = &applied {
                        guard.pending_sends.remove(local_id);
                    }
                    applied
                };
                let notify = match applied {
                    Applied::Appended(m) => Some(SessionEvent::MessageAppended(m)),
                    Applied::Replaced { message, .. } => {
                        Some(SessionEvent::MessageUpdated(message))
                    }
                    Applied::Updated(m) => Some(SessionEvent::MessageUpdated(m)),
                    Applied::Removed(id) => Some(SessionEvent::MessageRemoved(id)),
                    Applied::Ignored => None,
                };
                if let Some(ev) = notify {
                    if event_tx.send(ev).await.is_err() {
                        debug!("session event dropped: no subscriber");
                    }
                }
            }
        })
    }

    async fn emit(&self, event: SessionEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!("session event dropped: no subscriber");
        }
    }
}
