//! Creation, readiness and visibility of secondary windows.
//!
//! Window creation is asynchronous and a new window needs time to bootstrap
//! before it can usefully receive messages. [`WindowCoordinator`] creates a
//! window and waits for it to announce itself on a ready topic, and wraps
//! show/hide/close so that racing against a window that is gone (or going)
//! is never an error for the caller.

mod layout;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use panesync_core::{ReadyPayload, WINDOW_READY_TOPIC, WindowLabel};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, MessageChannel, MessageChannelExt, lock};

pub use layout::{
    CALL_ACCEPT_H_PX, CALL_ACCEPT_W_PX, CALL_H_PX, CALL_W_PX, NOTIFY_BASE_H_PX, NOTIFY_MAX_ROWS,
    NOTIFY_ROW_H_PX, NOTIFY_W_PX, Platform, PREVIEW_H_PX, PREVIEW_W_PX, ScreenArea,
    WindowDescriptor, descriptor_for, popup_position,
};

#[derive(Debug, Error)]
pub enum WindowError {
    #[error("{operation} on window {label:?} failed: {message}")]
    Host {
        label: WindowLabel,
        operation: &'static str,
        message: String,
    },
    #[error("window {0:?} already exists")]
    AlreadyExists(WindowLabel),
}

/// A live host window.
pub trait WindowHandle: Send + Sync {
    fn label(&self) -> &str;

    fn show(&self) -> impl Future<Output = Result<(), WindowError>> + Send;

    fn hide(&self) -> impl Future<Output = Result<(), WindowError>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), WindowError>> + Send;

    fn set_focus(&self) -> impl Future<Output = Result<(), WindowError>> + Send;

    fn is_visible(&self) -> impl Future<Output = Result<bool, WindowError>> + Send;
}

/// Label -> window lookup and window creation, provided by the host.
pub trait WindowRegistry: Send + Sync {
    type Handle: WindowHandle;

    /// `None` when the window was never created or has closed.
    fn get_by_label(&self, label: &str) -> impl Future<Output = Option<Self::Handle>> + Send;

    fn create(
        &self,
        label: &str,
        descriptor: &WindowDescriptor,
    ) -> impl Future<Output = Result<Self::Handle, WindowError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Unborn,
    /// Created (or being created) and not yet seen ready.
    Creating,
    Hidden,
    Visible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowOutcome {
    /// The window existed and was shown and focused (failures there are logged).
    Shown,
    Created,
    Failed,
}

pub struct WindowCoordinator<R> {
    registry: R,
    channel: Arc<dyn MessageChannel>,
    ready_topic: String,
    creating: Arc<Mutex<HashMap<WindowLabel, usize>>>,
}

impl<R: WindowRegistry> WindowCoordinator<R> {
    pub fn new(registry: R, channel: Arc<dyn MessageChannel>) -> Self {
        Self {
            registry,
            channel,
            ready_topic: WINDOW_READY_TOPIC.to_owned(),
            creating: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Waits on `topic` instead of `window-ready`, e.g. `call-ready`.
    pub fn with_ready_topic(mut self, topic: impl Into<String>) -> Self {
        self.ready_topic = topic.into();
        self
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn ready_topic(&self) -> &str {
        &self.ready_topic
    }

    /// Creates `label` and waits up to `timeout` for it to announce itself.
    ///
    /// Returns `false` when the window could not be created, or was not
    /// both created and ready within `timeout`; the caller should surface
    /// that to the user.
    /// A ready signal arriving after the timeout is not observed.
    pub async fn create_and_await_ready(
        &self,
        label: &str,
        descriptor: &WindowDescriptor,
        timeout: Duration,
    ) -> bool {
        // Listen before creating: a fast window may announce before
        // `create` even returns.
        let mut ready = self.channel.listen(&self.ready_topic);
        let _creating = CreationGuard::enter(&self.creating, label);

        // The create call counts against `timeout`.
        let create_and_wait = async {
            if let Err(err) = self.registry.create(label, descriptor).await {
                warn!(label = %label, "window creation failed: {}", err);
                return false;
            }
            debug!(label = %label, topic = %self.ready_topic, "window created, waiting for ready");

            while let Some(event) = ready.recv().await {
                match event.decode::<ReadyPayload>() {
                    Ok(payload) if payload.label == label => {
                        info!(label = %label, "window ready");
                        return true;
                    }
                    Ok(_) => {}
                    Err(err) => debug!(source = %event.source, "ignoring malformed ready payload: {}", err),
                }
            }
            warn!(label = %label, "channel closed while waiting for window ready");
            false
        };

        match tokio::time::timeout(timeout, create_and_wait).await {
            Ok(ready) => ready,
            Err(_) => {
                warn!(label = %label, timeout_ms = timeout.as_millis() as u64, "timed out waiting for window ready");
                false
            }
        }
    }

    /// Brings `label` to the front, creating it when it does not exist.
    /// Does not wait for readiness.
    pub async fn show_or_create(&self, label: &str, descriptor: &WindowDescriptor) -> ShowOutcome {
        if let Some(handle) = self.registry.get_by_label(label).await {
            if let Err(err) = handle.show().await {
                warn!(label = %label, "show failed: {}", err);
            }
            if let Err(err) = handle.set_focus().await {
                warn!(label = %label, "focus failed: {}", err);
            }
            return ShowOutcome::Shown;
        }

        match self.registry.create(label, descriptor).await {
            Ok(_) => {
                debug!(label = %label, "window created");
                ShowOutcome::Created
            }
            Err(err) => {
                warn!(label = %label, "window creation failed: {}", err);
                ShowOutcome::Failed
            }
        }
    }

    pub async fn hide_if_exists(&self, label: &str) {
        let Some(handle) = self.registry.get_by_label(label).await else {
            debug!(label = %label, "hide skipped, no such window");
            return;
        };
        if let Err(err) = handle.hide().await {
            warn!(label = %label, "hide failed: {}", err);
        }
    }

    pub async fn close_if_exists(&self, label: &str) {
        let Some(handle) = self.registry.get_by_label(label).await else {
            debug!(label = %label, "close skipped, no such window");
            return;
        };
        if let Err(err) = handle.close().await {
            warn!(label = %label, "close failed: {}", err);
        }
    }

    pub async fn state_of(&self, label: &str) -> WindowState {
        if lock(&self.creating).contains_key(label) {
            return WindowState::Creating;
        }
        let Some(handle) = self.registry.get_by_label(label).await else {
            return WindowState::Unborn;
        };
        match handle.is_visible().await {
            Ok(true) => WindowState::Visible,
            Ok(false) => WindowState::Hidden,
            Err(err) => {
                warn!(label = %label, "visibility query failed: {}", err);
                WindowState::Hidden
            }
        }
    }
}

impl<R> std::fmt::Debug for WindowCoordinator<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowCoordinator")
            .field("label", &self.channel.label())
            .field("ready_topic", &self.ready_topic)
            .field("creating", &*lock(&self.creating))
            .finish()
    }
}

/// Marks a label as being created until dropped.
struct CreationGuard {
    creating: Arc<Mutex<HashMap<WindowLabel, usize>>>,
    label: WindowLabel,
}

impl CreationGuard {
    fn enter(creating: &Arc<Mutex<HashMap<WindowLabel, usize>>>, label: &str) -> Self {
        *lock(creating).entry(label.to_owned()).or_default() += 1;
        Self {
            creating: Arc::clone(creating),
            label: label.to_owned(),
        }
    }
}

impl Drop for CreationGuard {
    fn drop(&mut self) {
        let mut creating = lock(&self.creating);
        if let Some(count) = creating.get_mut(&self.label) {
            *count -= 1;
            if *count == 0 {
                creating.remove(&self.label);
            }
        }
    }
}

/// Called by a secondary window once it has finished bootstrapping.
pub fn announce_ready<C>(channel: &C, topic: &str) -> Result<(), ChannelError>
where
    C: MessageChannel + ?Sized,
{
    debug!(label = %channel.label(), topic = %topic, "announcing ready");
    channel.emit_json(
        topic,
        &ReadyPayload {
            label: channel.label().to_owned(),
        },
    )
}
