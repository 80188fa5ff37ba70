//! Label-addressed pub/sub between windows.
//!
//! A [`MessageChannel`] is one window's view of the host event system:
//! `emit` reaches every open window (the sender included), `emit_to` reaches
//! exactly one, and `listen` only observes events emitted after it was
//! registered. Nothing is buffered for windows that are not open yet.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use panesync_core::{CoreError, WindowLabel, validate_label};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("window label {0:?} is already open")]
    LabelInUse(WindowLabel),
    #[error(transparent)]
    InvalidLabel(#[from] CoreError),
    #[error("channel is closed")]
    Closed,
    #[error("payload encoding failed: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("relay url {url:?} is invalid: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("relay rejected window: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub topic: String,
    pub source: WindowLabel,
    pub payload: Value,
}

impl Event {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ChannelError> {
        Ok(T::deserialize(&self.payload)?)
    }
}

pub trait MessageChannel: Send + Sync {
    /// Label of the window this channel belongs to.
    fn label(&self) -> &str;

    fn emit(&self, topic: &str, payload: Value) -> Result<(), ChannelError>;

    fn emit_to(&self, target: &str, topic: &str, payload: Value) -> Result<(), ChannelError>;

    fn listen(&self, topic: &str) -> Subscription;
}

/// Typed wrappers over the JSON-level channel methods.
pub trait MessageChannelExt: MessageChannel {
    fn emit_json<T: Serialize + ?Sized>(&self, topic: &str, payload: &T) -> Result<(), ChannelError> {
        self.emit(topic, serde_json::to_value(payload)?)
    }

    fn emit_json_to<T: Serialize + ?Sized>(
        &self,
        target: &str,
        topic: &str,
        payload: &T,
    ) -> Result<(), ChannelError> {
        self.emit_to(target, topic, serde_json::to_value(payload)?)
    }
}

impl<C: MessageChannel + ?Sized> MessageChannelExt for C {}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Listener = (u64, mpsc::UnboundedSender<Event>);

/// Per-window dispatch table from topic to live subscriptions.
#[derive(Debug, Default)]
pub(crate) struct ListenerTable {
    next_id: AtomicU64,
    topics: Mutex<HashMap<String, Vec<Listener>>>,
}

impl ListenerTable {
    pub(crate) fn listen(self: &Arc<Self>, topic: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.topics)
            .entry(topic.to_owned())
            .or_default()
            .push((id, tx));
        Subscription {
            topic: topic.to_owned(),
            id,
            rx,
            table: Arc::downgrade(self),
        }
    }

    /// Returns how many subscriptions received the event.
    pub(crate) fn dispatch(&self, event: &Event) -> usize {
        let mut topics = lock(&self.topics);
        let Some(listeners) = topics.get_mut(&event.topic) else {
            return 0;
        };
        listeners.retain(|(_, tx)| !tx.is_closed());
        listeners
            .iter()
            .filter(|(_, tx)| tx.send(event.clone()).is_ok())
            .count()
    }

    fn remove(&self, topic: &str, id: u64) {
        let mut topics = lock(&self.topics);
        if let Some(listeners) = topics.get_mut(topic) {
            listeners.retain(|(listener_id, _)| *listener_id != id);
            if listeners.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

/// A live registration on one topic. Dropping it unregisters the listener.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<Event>,
    table: Weak<ListenerTable>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the next event. `None` once the owning channel is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.remove(&self.topic, self.id);
        }
    }
}

/// In-process hub for windows that share an address space.
#[derive(Debug, Clone, Default)]
pub struct LocalBus {
    windows: Arc<Mutex<HashMap<WindowLabel, Arc<ListenerTable>>>>,
}

impl LocalBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the endpoint for `label`. The window stays reachable until the
    /// returned channel is dropped.
    pub fn open(&self, label: &str) -> Result<LocalChannel, ChannelError> {
        validate_label(label)?;
        let listeners = Arc::new(ListenerTable::default());
        let mut windows = lock(&self.windows);
        if windows.contains_key(label) {
            return Err(ChannelError::LabelInUse(label.to_owned()));
        }
        windows.insert(label.to_owned(), Arc::clone(&listeners));
        drop(windows);

        debug!(label = %label, "local window opened");
        Ok(LocalChannel {
            bus: self.clone(),
            label: label.to_owned(),
            listeners,
        })
    }

    pub fn is_open(&self, label: &str) -> bool {
        lock(&self.windows).contains_key(label)
    }

    pub fn windows(&self) -> Vec<WindowLabel> {
        let mut labels = lock(&self.windows).keys().cloned().collect::<Vec<_>>();
        labels.sort();
        labels
    }

    fn deliver(&self, target: Option<&str>, event: Event) {
        let recipients = {
            let windows = lock(&self.windows);
            match target {
                Some(target) => windows.get(target).cloned().into_iter().collect::<Vec<_>>(),
                None => windows.values().cloned().collect(),
            }
        };

        if recipients.is_empty() {
            debug!(topic = %event.topic, recipient = ?target, "no recipient for event, dropping");
            return;
        }
        for listeners in recipients {
            listeners.dispatch(&event);
        }
    }
}

#[derive(Debug)]
pub struct LocalChannel {
    bus: LocalBus,
    label: WindowLabel,
    listeners: Arc<ListenerTable>,
}

impl LocalChannel {
    fn event(&self, topic: &str, payload: Value) -> Event {
        Event {
            topic: topic.to_owned(),
            source: self.label.clone(),
            payload,
        }
    }
}

impl MessageChannel for LocalChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn emit(&self, topic: &str, payload: Value) -> Result<(), ChannelError> {
        self.bus.deliver(None, self.event(topic, payload));
        Ok(())
    }

    fn emit_to(&self, target: &str, topic: &str, payload: Value) -> Result<(), ChannelError> {
        self.bus.deliver(Some(target), self.event(topic, payload));
        Ok(())
    }

    fn listen(&self, topic: &str) -> Subscription {
        self.listeners.listen(topic)
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        let mut windows = lock(&self.bus.windows);
        if windows
            .get(&self.label)
            .is_some_and(|listeners| Arc::ptr_eq(listeners, &self.listeners))
        {
            windows.remove(&self.label);
        }
        drop(windows);
        debug!(label = %self.label, "local window closed");
    }
}
