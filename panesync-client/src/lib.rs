//! Window-side half of panesync: message channels, reactive stores, the
//! cross-window sync engine and the window lifecycle coordinator.

pub mod channel;
pub mod config;
pub mod relay;
pub mod store;
pub mod sync;
pub mod window;

pub use channel::{
    ChannelError, Event, LocalBus, LocalChannel, MessageChannel, MessageChannelExt, Subscription,
};
pub use config::{ConfigError, MAX_MANIFEST_BYTES, SyncManifest, load_manifest_from_path, parse_manifest_json};
pub use relay::{RelayChannel, RelayOptions};
pub use store::{JsonStore, ListenerId, ReactiveStore, StoreListener};
pub use sync::{SyncConfig, SyncEngine, SyncError, SyncOptions, SyncPlugin, SyncRole};
pub use window::{
    Platform, ScreenArea, ShowOutcome, WindowCoordinator, WindowDescriptor, WindowError,
    WindowHandle, WindowRegistry, WindowState, announce_ready, popup_position,
};
