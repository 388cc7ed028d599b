//! Response multiplexer: one background task per `message_id`, drained by
//! any number of (re)connecting HTTP consumers through a shared queue.

pub mod event;
mod task;

pub use event::StreamEvent;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::billing::BillingGate;
use crate::config::{Config, RelayConfig};
use crate::dispatch::{
    ChatCall, ChatMessage, ChatProvider, DeltaSink, Frame, FrameSink, StreamStatus,
};
use crate::error::RelayError;
use crate::store::{AccountStore, HistoryEntry, HistoryStore, Role, UsageLedger};
use crate::tags;

const ALREADY_COMPLETED: &str = "this request has already completed; submit a new request";
const EMPTY_PROMPT: &str = "prompt must not be empty";
const STOP_PUSHES: usize = 3;

const TITLE_PROMPT: &str = "Write a title for the conversation above. Reply with the title only: \
concise, at most ten words, no markdown, no quotation marks, no emoji, no special characters, no brackets.";
const TITLE_MAX_TOKENS: u64 = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Running,
    Finished,
    Error,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub message_id: String,
    pub prompt: String,
    pub conversation_id: String,
    /// Display name of the model.
    pub model: String,
    /// Base64 image attached to this turn.
    pub attachment: Option<String>,
    /// `None` is an anonymous caller.
    pub user_id: Option<String>,
    pub web_search: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveResponse {
    pub message_id: String,
    pub conversation_id: String,
    pub status: Status,
}

/// The persistence seams a multiplexer works against.
#[derive(Clone)]
pub struct Stores {
    pub history: Arc<dyn HistoryStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub ledger: Arc<dyn UsageLedger>,
}

impl Stores {
    /// Use one backend for all three seams.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: HistoryStore + AccountStore + UsageLedger + 'static,
    {
        Self {
            history: store.clone(),
            accounts: store.clone(),
            ledger: store,
        }
    }
}

/// In-memory state of one generation.
struct Slot {
    message_id: String,
    conversation_id: String,
    user_id: Option<String>,
    status: Mutex<Status>,
    /// Undelivered frames. Holds at most one snapshot between other frames.
    queue: Mutex<VecDeque<Frame>>,
    ready: Notify,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    cleanup_scheduled: AtomicBool,
}

impl Slot {
    fn new(req: &GenerateRequest) -> Self {
        Self {
            message_id: req.message_id.clone(),
            conversation_id: req.conversation_id.clone(),
            user_id: req.user_id.clone(),
            status: Mutex::new(Status::Running),
            queue: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
            cleanup_scheduled: AtomicBool::new(false),
        }
    }

    fn status(&self) -> Status {
        *lock(&self.status)
    }

    /// Move a running slot to `to`. Terminal statuses are never changed;
    /// returns false when the slot was not running.
    fn finish(&self, to: Status) -> bool {
        let mut status = lock(&self.status);
        if status.is_terminal() {
            return false;
        }
        *status = to;
        true
    }

    /// Wait until a frame is queued and take it.
    async fn next_frame(&self) -> Frame {
        loop {
            let ready = self.ready.notified();
            let frame = lock(&self.queue).pop_front();
            if let Some(frame) = frame {
                return frame;
            }
            ready.await;
        }
    }
}

impl FrameSink for Slot {
    /// Snapshots are cumulative, so a newer one replaces an undelivered one.
    fn push(&self, frame: Frame) {
        {
            let mut queue = lock(&self.queue);
            let frame = match (queue.back_mut(), frame) {
                (Some(Frame::Snapshot(pending)), Frame::Snapshot(newer)) => {
                    *pending = newer;
                    None
                }
                (_, frame) => Some(frame),
            };
            if let Some(frame) = frame {
                queue.push_back(frame);
            }
        }
        self.ready.notify_one();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    provider: Arc<dyn ChatProvider>,
    history: Arc<dyn HistoryStore>,
    accounts: Arc<dyn AccountStore>,
    billing: BillingGate,
    config: RelayConfig,
    title_model: Option<String>,
}

impl Inner {
    fn slot(&self, message_id: &str) -> Option<Arc<Slot>> {
        lock(&self.slots).get(message_id).cloned()
    }

    /// Remove `slot` only if it is still the registered one for its id.
    fn remove_if_same(&self, slot: &Arc<Slot>) -> bool {
        let mut slots = lock(&self.slots);
        if slots
            .get(&slot.message_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            slots.remove(&slot.message_id);
            return true;
        }
        false
    }

    /// Fire-and-forget removal after the grace window, at most once per slot.
    fn schedule_cleanup(self: &Arc<Self>, slot: &Arc<Slot>) {
        if slot.cleanup_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let slot = Arc::clone(slot);
        let grace = Duration::from_secs(self.config.cleanup_grace_secs);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = weak.upgrade() {
                if inner.remove_if_same(&slot) {
                    tracing::debug!(message_id = %slot.message_id, "slot cleaned up");
                }
            }
        });
    }

    /// Wait for the next queue item, bounded by the poll wait.
    /// Returns the event and whether the stream ends with it.
    async fn next_event(&self, slot: &Slot) -> (StreamEvent, bool) {
        let id = slot.message_id.as_str();
        let frame = tokio::time::timeout(self.config.poll_wait(), slot.next_frame()).await;

        match frame {
            Ok(Frame::End) => (StreamEvent::finished(id), true),
            Ok(Frame::Error(message)) => {
                (StreamEvent::error(id, format!("error: {message}")), false)
            }
            Ok(Frame::Snapshot(snapshot)) => (StreamEvent::content(id, &snapshot), false),
            Err(_) if slot.status().is_terminal() => (StreamEvent::finished(id), true),
            Err(_) => (StreamEvent::heartbeat(id), false),
        }
    }
}

enum Phase {
    /// Emit the opening record, then follow the slot if there is one.
    Open(StreamEvent, Option<Arc<Slot>>),
    Follow(Arc<Slot>),
}

/// Owns the slot registry; cheap to clone.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

impl Multiplexer {
    pub fn new(provider: Arc<dyn ChatProvider>, stores: Stores, config: &Config) -> Self {
        let billing = BillingGate::new(
            stores.accounts.clone(),
            stores.ledger.clone(),
            config.billing.clone(),
        );
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(HashMap::new()),
                provider,
                history: stores.history,
                accounts: stores.accounts,
                billing,
                config: config.relay.clone(),
                title_model: config.title_model.clone(),
            }),
        }
    }

    pub fn provider(&self) -> &Arc<dyn ChatProvider> {
        &self.inner.provider
    }

    /// Start, resume or refuse a generation and stream its records.
    ///
    /// The slot (if any) is created before this returns, so a second call
    /// with the same id always observes it.
    pub fn generate(
        &self,
        req: GenerateRequest,
    ) -> impl Stream<Item = StreamEvent> + Send + 'static {
        let opening = self.open(req);
        let inner = Arc::clone(&self.inner);

        futures_util::stream::unfold(Some(opening), move |phase| {
            let inner = Arc::clone(&inner);
            async move {
                match phase? {
                    Phase::Open(event, next) => Some((event, next.map(Phase::Follow))),
                    Phase::Follow(slot) => {
                        let (event, done) = inner.next_event(&slot).await;
                        if done {
                            if slot.status().is_terminal() {
                                inner.schedule_cleanup(&slot);
                            }
                            Some((event, None))
                        } else {
                            Some((event, Some(Phase::Follow(slot))))
                        }
                    }
                }
            }
        })
    }

    fn open(&self, req: GenerateRequest) -> Phase {
        let id = req.message_id.clone();
        let mut slots = lock(&self.inner.slots);

        if let Some(existing) = slots.get(&id) {
            match existing.status() {
                Status::Running => {
                    tracing::info!(message_id = %id, "consumer reconnected");
                    return Phase::Open(StreamEvent::connected(&id), Some(Arc::clone(existing)));
                }
                Status::Finished => {
                    return Phase::Open(StreamEvent::error(&id, ALREADY_COMPLETED), None);
                }
                Status::Error => {
                    tracing::info!(message_id = %id, "retrying failed generation");
                }
            }
        }

        if req.prompt.trim().is_empty() && req.attachment.is_none() {
            return Phase::Open(StreamEvent::error(&id, EMPTY_PROMPT), None);
        }

        let slot = Arc::new(Slot::new(&req));
        slots.insert(id.clone(), Arc::clone(&slot));

        let span = tracing::info_span!(
            "generation",
            message_id = %id,
            conversation_id = %req.conversation_id,
            model = %req.model
        );
        let handle = tokio::spawn(
            task::run(Arc::clone(&self.inner), Arc::clone(&slot), req).instrument(span),
        );
        *lock(&slot.handle) = Some(handle);
        drop(slots);

        tracing::info!(message_id = %id, "generation started");
        Phase::Open(StreamEvent::started(&id), Some(slot))
    }

    pub fn status(&self, message_id: &str) -> Option<Status> {
        self.inner.slot(message_id).map(|s| s.status())
    }

    /// Running generations, optionally only those of `user_id`.
    pub fn running(&self, user_id: Option<&str>) -> Vec<ActiveResponse> {
        let slots = lock(&self.inner.slots);
        let mut active: Vec<ActiveResponse> = slots
            .values()
            .filter(|s| s.status() == Status::Running)
            .filter(|s| user_id.is_none_or(|u| s.user_id.as_deref() == Some(u)))
            .map(|s| ActiveResponse {
                message_id: s.message_id.clone(),
                conversation_id: s.conversation_id.clone(),
                status: Status::Running,
            })
            .collect();
        active.sort_by(|a, b| a.message_id.cmp(&b.message_id));
        active
    }

    /// Stop a running generation. Returns false for unknown or
    /// already-terminal ids.
    pub async fn stop(&self, message_id: &str) -> bool {
        let Some(slot) = self.inner.slot(message_id) else {
            return false;
        };
        if !slot.finish(Status::Finished) {
            return false;
        }

        slot.cancel.cancel();
        for _ in 0..STOP_PUSHES {
            slot.push(Frame::End);
        }

        let handle = lock(&slot.handle).take();
        if let Some(mut handle) = handle {
            let join_timeout = Duration::from_millis(self.inner.config.stop_join_timeout_ms);
            if tokio::time::timeout(join_timeout, &mut handle).await.is_err() {
                // Last resort: the task ignored cancellation.
                tracing::warn!(message_id, "generation did not stop in time, aborting task");
                handle.abort();
            }
        }

        self.inner.remove_if_same(&slot);
        tracing::info!(message_id, "generation stopped");
        true
    }

    /// Ask the title model for a short conversation title.
    pub async fn name_conversation(&self, conversation_id: &str) -> Result<String, RelayError> {
        let model = self
            .inner
            .title_model
            .clone()
            .ok_or_else(|| RelayError::Config("no title model configured".to_string()))?;

        let history = self.inner.history.load(conversation_id).await?;
        if history.is_empty() {
            return Err(RelayError::NotFound(format!(
                "conversation {conversation_id}"
            )));
        }

        let mut messages: Vec<ChatMessage> = history
            .iter()
            .map(|HistoryEntry { role, content }| {
                ChatMessage::text(*role, tags::strip_for_replay(*role, content))
            })
            .collect();
        messages.push(ChatMessage::text(Role::User, TITLE_PROMPT));

        let call = ChatCall {
            model,
            messages,
            image: None,
            web_search: false,
            max_tokens: TITLE_MAX_TOKENS,
        };
        let outcome = self
            .inner
            .provider
            .stream(call, &DeltaSink::discard(), &CancellationToken::new())
            .await;

        if let StreamStatus::Failed(message) = outcome.status {
            return Err(RelayError::Other(message));
        }
        let (_, rest) = tags::parse_model(&outcome.text);
        let (_, title) = tags::parse_think(&rest);
        Ok(title)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(slot: &Slot) -> Vec<Frame> {
        lock(&slot.queue).drain(..).collect()
    }

    #[test]
    fn undelivered_snapshots_collapse_to_latest() {
        let slot = Slot::new(&GenerateRequest::default());
        slot.push(Frame::Snapshot("a".to_string()));
        slot.push(Frame::Snapshot("ab".to_string()));
        slot.push(Frame::Error("oops".to_string()));
        slot.push(Frame::Snapshot("abc".to_string()));
        slot.push(Frame::Snapshot("abcd".to_string()));
        slot.push(Frame::End);

        assert_eq!(
            drain(&slot),
            vec![
                Frame::Snapshot("ab".to_string()),
                Frame::Error("oops".to_string()),
                Frame::Snapshot("abcd".to_string()),
                Frame::End,
            ]
        );
    }

    #[tokio::test]
    async fn next_frame_wakes_on_push() {
        let slot = Arc::new(Slot::new(&GenerateRequest::default()));
        let producer = Arc::clone(&slot);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            producer.push(Frame::Snapshot("late".to_string()));
        });

        let frame = tokio::time::timeout(Duration::from_secs(2), slot.next_frame())
            .await
            .unwrap();
        assert_eq!(frame, Frame::Snapshot("late".to_string()));
    }
}
