use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use panesync_core::StoreId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sync::SyncOptions;

pub const MAX_MANIFEST_BYTES: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to stat manifest {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("manifest {path} is too large ({len} bytes); limit is {max} bytes")]
    TooLarge { path: PathBuf, len: u64, max: u64 },
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse manifest{}: {source}", display_path(.path))]
    Parse {
        path: Option<PathBuf>,
        #[source]
        source: serde_json::Error,
    },
}

fn display_path(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|path| format!(" {}", path.display()))
        .unwrap_or_default()
}

/// Which stores a window syncs, and how.
///
/// ```json
/// {
///   "defaults": { "debounce": 50 },
///   "stores": {
///     "call": { "paths": ["friendInfo", "roomId"] },
///     "settings": { "paths": ["theme"], "sourceWindow": "main" }
///   }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncManifest {
    pub defaults: SyncOptions,
    pub stores: BTreeMap<StoreId, SyncOptions>,
}

impl SyncManifest {
    /// The store's own entry, or empty options when it has none.
    pub fn options_for(&self, store_id: &str) -> SyncOptions {
        self.stores.get(store_id).cloned().unwrap_or_default()
    }

    pub fn store_ids(&self) -> impl Iterator<Item = &str> {
        self.stores.keys().map(String::as_str)
    }
}

pub fn parse_manifest_json(json: &str) -> Result<SyncManifest, ConfigError> {
    serde_json::from_str(json).map_err(|source| ConfigError::Parse { path: None, source })
}

pub fn load_manifest_from_path(path: impl AsRef<Path>) -> Result<SyncManifest, ConfigError> {
    let path = path.as_ref();
    let meta = std::fs::metadata(path).map_err(|source| ConfigError::Metadata {
        path: path.to_path_buf(),
        source,
    })?;
    if meta.len() > MAX_MANIFEST_BYTES {
        return Err(ConfigError::TooLarge {
            path: path.to_path_buf(),
            len: meta.len(),
            max: MAX_MANIFEST_BYTES,
        });
    }

    let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
        path: Some(path.to_path_buf()),
        source,
    })
}
