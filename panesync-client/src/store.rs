use std::sync::{
    Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard,
    atomic::{AtomicU64, Ordering},
};

use panesync_core::{CoreError, StatePatch, StoreId, apply_patch, get_path, set_path};
use serde_json::Value;

use crate::channel::lock;

pub type ListenerId = u64;
pub type StoreListener = Box<dyn Fn(&Value) + Send + Sync>;

/// A mutable state container for one domain (`call`, `chat`, `settings`...).
///
/// Listeners run synchronously after every committed mutation, outside any
/// store lock, and receive the post-mutation state. They must not call back
/// into the store.
pub trait ReactiveStore: Send + Sync {
    fn id(&self) -> &str;

    fn state(&self) -> Value;

    fn subscribe(&self, listener: StoreListener) -> ListenerId;

    fn unsubscribe(&self, id: ListenerId);

    /// Applies `partial` (field path -> value) as one mutation. On error the
    /// state is left untouched and no listener runs.
    fn patch(&self, partial: &StatePatch) -> Result<(), CoreError>;
}

type SharedListener = Arc<dyn Fn(&Value) + Send + Sync>;

/// `serde_json::Value`-backed store.
pub struct JsonStore {
    id: StoreId,
    state: RwLock<Value>,
    next_listener_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, SharedListener)>>,
}

impl JsonStore {
    pub fn new(id: impl Into<StoreId>, initial: Value) -> Self {
        Self {
            id: id.into(),
            state: RwLock::new(initial),
            next_listener_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        get_path(&self.read(), path).cloned()
    }

    pub fn set(&self, path: &str, value: Value) -> Result<(), CoreError> {
        self.try_mutate(|state| set_path(state, path, value))
    }

    /// Runs `f` against the state and notifies listeners afterwards.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Value) -> R) -> R {
        let (result, snapshot) = {
            let mut state = self.write();
            let result = f(&mut state);
            (result, state.clone())
        };
        self.notify(&snapshot);
        result
    }

    /// Like [`JsonStore::mutate`], but the mutation is only committed (and
    /// listeners only run) when `f` succeeds.
    pub fn try_mutate<E>(&self, f: impl FnOnce(&mut Value) -> Result<(), E>) -> Result<(), E> {
        let snapshot = {
            let mut state = self.write();
            let mut draft = state.clone();
            f(&mut draft)?;
            *state = draft;
            state.clone()
        };
        self.notify(&snapshot);
        Ok(())
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    fn notify(&self, snapshot: &Value) {
        let listeners = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect::<Vec<_>>();
        for listener in listeners {
            listener(snapshot);
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Value> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Value> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for JsonStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonStore")
            .field("id", &self.id)
            .field("state", &*self.read())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl ReactiveStore for JsonStore {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> Value {
        self.read().clone()
    }

    fn subscribe(&self, listener: StoreListener) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).push((id, Arc::from(listener)));
        id
    }

    fn unsubscribe(&self, id: ListenerId) {
        lock(&self.listeners).retain(|(listener_id, _)| *listener_id != id);
    }

    fn patch(&self, partial: &StatePatch) -> Result<(), CoreError> {
        self.try_mutate(|state| apply_patch(state, partial))
    }
}
