//! Keeps selected fields of a [`ReactiveStore`] consistent across windows.
//!
//! Each window attaches one [`SyncEngine`] per synced store. Local mutations
//! are coalesced over the debounce window and broadcast on
//! [`STATE_SYNC_TOPIC`]; remote updates are patched back into the store with
//! the engine's own broadcast suppressed. When a store names a source window,
//! only that window publishes and every other window asks it for state on
//! [`STATE_SYNC_REQUEST_TOPIC`].

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, Weak},
    thread::{self, ThreadId},
    time::Duration,
};

use panesync_core::{
    CoreError, DEFAULT_DEBOUNCE_MS, FieldPath, STATE_SYNC_REQUEST_TOPIC, STATE_SYNC_TOPIC,
    StatePatch, StoreId, SyncMessage, SyncRequestMessage, WindowLabel, extract_patch,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::{runtime::Handle, sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    channel::{Event, MessageChannel, MessageChannelExt, Subscription, lock},
    config::SyncManifest,
    store::{ListenerId, ReactiveStore},
};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store {0:?} already has a sync engine attached")]
    AlreadyAttached(StoreId),
    #[error("invalid sync config for store {store_id:?}: {source}")]
    InvalidConfig {
        store_id: StoreId,
        #[source]
        source: CoreError,
    },
    #[error("sync engine must be attached inside a tokio runtime")]
    NoRuntime,
}

/// Per-store sync options as written in a manifest. Unset fields fall back
/// to the plugin defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncOptions {
    pub paths: Option<Vec<String>>,
    pub target_windows: Option<Vec<WindowLabel>>,
    pub source_window: Option<WindowLabel>,
    #[serde(alias = "debounce")]
    pub debounce_ms: Option<u64>,
}

impl SyncOptions {
    pub fn with_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: Some(paths.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn target_windows<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<WindowLabel>,
    {
        self.target_windows = Some(labels.into_iter().map(Into::into).collect());
        self
    }

    pub fn source_window(mut self, label: impl Into<WindowLabel>) -> Self {
        self.source_window = Some(label.into());
        self
    }

    pub fn debounce_ms(mut self, debounce_ms: u64) -> Self {
        self.debounce_ms = Some(debounce_ms);
        self
    }

    /// Fields set in `overrides` win.
    pub fn merged(&self, overrides: &SyncOptions) -> SyncOptions {
        SyncOptions {
            paths: overrides.paths.clone().or_else(|| self.paths.clone()),
            target_windows: overrides
                .target_windows
                .clone()
                .or_else(|| self.target_windows.clone()),
            source_window: overrides
                .source_window
                .clone()
                .or_else(|| self.source_window.clone()),
            debounce_ms: overrides.debounce_ms.or(self.debounce_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub store_id: StoreId,
    pub paths: Vec<FieldPath>,
    pub target_windows: Vec<WindowLabel>,
    pub source_window: Option<WindowLabel>,
    pub debounce: Duration,
}

impl SyncConfig {
    pub fn resolve(store_id: &str, options: &SyncOptions) -> Result<Self, SyncError> {
        let mut seen = HashSet::new();
        let mut paths = Vec::new();
        for raw in options.paths.iter().flatten() {
            if !seen.insert(raw.as_str()) {
                continue;
            }
            let path = FieldPath::parse(raw).map_err(|source| SyncError::InvalidConfig {
                store_id: store_id.to_owned(),
                source,
            })?;
            paths.push(path);
        }

        Ok(Self {
            store_id: store_id.to_owned(),
            paths,
            target_windows: options.target_windows.clone().unwrap_or_default(),
            source_window: options
                .source_window
                .clone()
                .filter(|label| !label.trim().is_empty()),
            debounce: Duration::from_millis(options.debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS)),
        })
    }

    pub fn is_enabled(&self) -> bool {
        !self.paths.is_empty()
    }

    pub fn role_of(&self, label: &str) -> SyncRole {
        match &self.source_window {
            Some(source) if source == label => SyncRole::Source,
            Some(_) => SyncRole::Follower,
            None => SyncRole::Peer,
        }
    }

    pub fn path_strings(&self) -> Vec<String> {
        self.paths.iter().map(|path| path.as_str().to_owned()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRole {
    /// Designated owner: publishes changes and answers requests.
    Source,
    /// Another window owns the store: never publishes, only requests.
    Follower,
    /// No owner configured: every window publishes its changes.
    Peer,
}

/// Attaches sync engines for one window.
#[derive(Clone)]
pub struct SyncPlugin {
    channel: Arc<dyn MessageChannel>,
    defaults: SyncOptions,
    attached: Arc<Mutex<HashSet<StoreId>>>,
}

impl SyncPlugin {
    /// `channel.label()` is taken as the current window's label.
    pub fn new(channel: Arc<dyn MessageChannel>, defaults: SyncOptions) -> Self {
        Self {
            channel,
            defaults,
            attached: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn from_manifest(channel: Arc<dyn MessageChannel>, manifest: &SyncManifest) -> Self {
        Self::new(channel, manifest.defaults.clone())
    }

    pub fn defaults(&self) -> &SyncOptions {
        &self.defaults
    }

    pub fn label(&self) -> &str {
        self.channel.label()
    }

    pub fn is_attached(&self, store_id: &str) -> bool {
        lock(&self.attached).contains(store_id)
    }

    /// Starts syncing `store`. Returns `Ok(None)` when the resolved config
    /// has no paths, in which case the store is left alone.
    pub fn attach(
        &self,
        store: Arc<dyn ReactiveStore>,
        options: &SyncOptions,
    ) -> Result<Option<SyncEngine>, SyncError> {
        let store_id = store.id().to_owned();
        let config = SyncConfig::resolve(&store_id, &self.defaults.merged(options))?;
        if !config.is_enabled() {
            info!(store_id = %store_id, "store has no synced paths, skipping");
            return Ok(None);
        }

        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;

        if !lock(&self.attached).insert(store_id.clone()) {
            return Err(SyncError::AlreadyAttached(store_id));
        }

        let label = self.channel.label().to_owned();
        let role = config.role_of(&label);
        info!(
            store_id = %store_id,
            label = %label,
            role = ?role,
            paths = ?config.path_strings(),
            targets = ?config.target_windows,
            source = ?config.source_window,
            debounce_ms = config.debounce.as_millis() as u64,
            "attaching sync engine"
        );

        // Channel listeners go first so a reply to the initial request
        // cannot arrive before anyone is listening.
        let updates = self.channel.listen(STATE_SYNC_TOPIC);
        let requests = (role == SyncRole::Source)
            .then(|| self.channel.listen(STATE_SYNC_REQUEST_TOPIC));

        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(EngineInner {
            config,
            label,
            role,
            channel: Arc::clone(&self.channel),
            store: Arc::clone(&store),
            pending: Mutex::new(StatePatch::new()),
            applying_remote: Mutex::new(None),
            flush_tx,
        });

        let tasks = vec![
            runtime.spawn(remote_task(Arc::clone(&inner), updates, requests)),
            runtime.spawn(debounce_task(Arc::clone(&inner), flush_rx)),
        ];

        let weak: Weak<EngineInner> = Arc::downgrade(&inner);
        let listener_id = store.subscribe(Box::new(move |state: &Value| {
            if let Some(inner) = weak.upgrade() {
                inner.on_local_change(state);
            }
        }));

        inner.sync_now();

        Ok(Some(SyncEngine {
            inner,
            listener_id,
            tasks,
            attached: Arc::clone(&self.attached),
        }))
    }

    pub fn attach_from_manifest(
        &self,
        store: Arc<dyn ReactiveStore>,
        manifest: &SyncManifest,
    ) -> Result<Option<SyncEngine>, SyncError> {
        let options = manifest.options_for(store.id());
        self.attach(store, &options)
    }
}

/// A live attachment between one store and the channel. Dropping it
/// detaches: the store listener is removed and pending changes are discarded.
pub struct SyncEngine {
    inner: Arc<EngineInner>,
    listener_id: ListenerId,
    tasks: Vec<JoinHandle<()>>,
    attached: Arc<Mutex<HashSet<StoreId>>>,
}

impl SyncEngine {
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn role(&self) -> SyncRole {
        self.inner.role
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Followers ask the source for fresh state; everyone else publishes
    /// the current values right away, skipping the debounce.
    pub fn sync_now(&self) {
        self.inner.sync_now();
    }

    /// Paths buffered for the next debounced flush.
    pub fn pending_paths(&self) -> Vec<String> {
        lock(&self.inner.pending).keys().cloned().collect()
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.inner.config)
            .field("label", &self.inner.label)
            .field("role", &self.inner.role)
            .finish()
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.inner.store.unsubscribe(self.listener_id);
        for task in &self.tasks {
            task.abort();
        }
        lock(&self.attached).remove(&self.inner.config.store_id);
        debug!(store_id = %self.inner.config.store_id, "sync engine detached");
    }
}

struct EngineInner {
    config: SyncConfig,
    label: WindowLabel,
    role: SyncRole,
    channel: Arc<dyn MessageChannel>,
    store: Arc<dyn ReactiveStore>,
    pending: Mutex<StatePatch>,
    /// Thread currently inside `store.patch` for a remote update. Only the
    /// notification raised by that call is suppressed; mutations made on
    /// other threads meanwhile are published as usual.
    applying_remote: Mutex<Option<ThreadId>>,
    flush_tx: mpsc::UnboundedSender<()>,
}

impl EngineInner {
    fn store_id(&self) -> &str {
        &self.config.store_id
    }

    fn on_local_change(&self, state: &Value) {
        if *lock(&self.applying_remote) == Some(thread::current().id()) {
            return;
        }
        if self.role == SyncRole::Follower {
            return;
        }

        let patch = extract_patch(state, &self.config.paths);
        if patch.is_empty() {
            return;
        }
        lock(&self.pending).extend(patch);
        let _ = self.flush_tx.send(());
    }

    fn flush(&self) {
        // Taken before sending so changes made meanwhile start a new buffer.
        let patch = std::mem::take(&mut *lock(&self.pending));
        self.publish(patch, &self.config.target_windows);
    }

    fn sync_now(&self) {
        match (&self.role, &self.config.source_window) {
            (SyncRole::Follower, Some(source)) => self.request_from(source),
            _ => {
                let patch = extract_patch(&self.store.state(), &self.config.paths);
                self.publish(patch, &self.config.target_windows);
            }
        }
    }

    fn publish(&self, state: StatePatch, to: &[WindowLabel]) {
        if state.is_empty() {
            return;
        }

        let message = SyncMessage::new(self.store_id(), state, self.label.as_str(), to);
        let payload = match serde_json::to_value(&message) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(store_id = %self.store_id(), "failed to encode sync message: {}", err);
                return;
            }
        };

        debug!(
            store_id = %self.store_id(),
            paths = ?message.state.keys().collect::<Vec<_>>(),
            to = ?message.to,
            "publishing state"
        );

        let result = if to.is_empty() {
            self.channel.emit(STATE_SYNC_TOPIC, payload)
        } else {
            to.iter().try_for_each(|target| {
                self.channel
                    .emit_to(target, STATE_SYNC_TOPIC, payload.clone())
            })
        };
        if let Err(err) = result {
            warn!(store_id = %self.store_id(), "failed to publish state: {}", err);
        }
    }

    fn request_from(&self, source: &str) {
        let request = SyncRequestMessage {
            store_id: self.store_id().to_owned(),
            from: self.label.clone(),
            to: source.to_owned(),
            paths: Some(self.config.path_strings()),
        };
        debug!(store_id = %self.store_id(), source = %source, "requesting state from source");
        if let Err(err) = self
            .channel
            .emit_json_to(source, STATE_SYNC_REQUEST_TOPIC, &request)
        {
            warn!(store_id = %self.store_id(), "failed to request state: {}", err);
        }
    }

    fn handle_update(&self, event: &Event) {
        let message: SyncMessage = match event.decode() {
            Ok(message) => message,
            Err(err) => {
                warn!(source = %event.source, "dropping malformed sync message: {}", err);
                return;
            }
        };
        if message.store_id != self.config.store_id {
            return;
        }
        if !message.is_addressed_to(&self.label) {
            debug!(store_id = %self.store_id(), to = ?message.to, "sync message not addressed to this window");
            return;
        }
        if message.from == self.label {
            return;
        }

        *lock(&self.applying_remote) = Some(thread::current().id());
        let result = self.store.patch(&message.state);
        *lock(&self.applying_remote) = None;

        match result {
            Ok(()) => debug!(
                store_id = %self.store_id(),
                from = %message.from,
                paths = message.state.len(),
                "applied remote state"
            ),
            Err(err) => warn!(
                store_id = %self.store_id(),
                from = %message.from,
                "failed to apply remote state: {}",
                err
            ),
        }
    }

    fn handle_request(&self, event: &Event) {
        let request: SyncRequestMessage = match event.decode() {
            Ok(request) => request,
            Err(err) => {
                warn!(source = %event.source, "dropping malformed sync request: {}", err);
                return;
            }
        };
        if request.store_id != self.config.store_id || request.to != self.label {
            return;
        }

        let requested = request.paths.as_deref().unwrap_or_default();
        let paths = if requested.is_empty() {
            self.config.paths.clone()
        } else {
            requested
                .iter()
                .filter_map(|raw| match FieldPath::parse(raw) {
                    Ok(path) => Some(path),
                    Err(err) => {
                        warn!(store_id = %self.store_id(), "ignoring requested path: {}", err);
                        None
                    }
                })
                .collect()
        };

        debug!(store_id = %self.store_id(), from = %request.from, "answering state request");
        let patch = extract_patch(&self.store.state(), &paths);
        self.publish(patch, std::slice::from_ref(&request.from));
    }
}

async fn remote_task(
    inner: Arc<EngineInner>,
    mut updates: Subscription,
    mut requests: Option<Subscription>,
) {
    loop {
        tokio::select! {
            event = updates.recv() => match event {
                Some(event) => inner.handle_update(&event),
                None => break,
            },
            event = next_request(&mut requests) => match event {
                Some(event) => inner.handle_request(&event),
                None => break,
            },
        }
    }
    debug!(store_id = %inner.store_id(), "channel closed, remote listener stopped");
}

async fn next_request(requests: &mut Option<Subscription>) -> Option<Event> {
    match requests {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

/// Flushes once no new change has arrived for the configured debounce.
async fn debounce_task(inner: Arc<EngineInner>, mut changes: mpsc::UnboundedReceiver<()>) {
    let debounce = inner.config.debounce;
    while changes.recv().await.is_some() {
        loop {
            match tokio::time::timeout(debounce, changes.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => {
                    inner.flush();
                    return;
                }
                Err(_) => break,
            }
        }
        inner.flush();
    }
}
