//! Persisted per-space configuration.
//!
//! The watch cache itself is never persisted. What survives a restart is, for
//! each chat space, its delivery target and the `{id, kind}` pairs it watches;
//! these are replayed through the watch path at startup.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::types::{SubscriberId, WatchedList};

/// Errors raised by a [`SpaceStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Configuration stored for one chat space.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceConfig {
    /// Incoming-webhook URL messages are posted to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// Lists the space watches, in the order they were added.
    #[serde(default)]
    pub watched: Vec<WatchedList>,
}

impl SpaceConfig {
    /// Records a watched list. Returns `false` if it was already recorded.
    pub fn add_watch(&mut self, list: WatchedList) -> bool {
        if self.watched.contains(&list) {
            return false;
        }
        self.watched.push(list);
        true
    }

    /// Forgets the given lists. Returns how many were removed.
    pub fn remove_watches(&mut self, lists: &[WatchedList]) -> usize {
        let before = self.watched.len();
        self.watched.retain(|watched| !lists.contains(watched));
        before - self.watched.len()
    }
}

/// Edit applied to a space's configuration by [`SpaceStore::update`].
pub type SpaceEdit = Box<dyn FnOnce(&mut SpaceConfig) + Send>;

/// Applies `edit` to a copy of `current`. Returns the edited configuration and
/// whether it differs from what is stored.
fn apply_edit(current: Option<&SpaceConfig>, edit: SpaceEdit) -> (SpaceConfig, bool) {
    let mut config = current.cloned().unwrap_or_default();
    edit(&mut config);
    let changed = match current {
        Some(current) => *current != config,
        None => config != SpaceConfig::default(),
    };
    (config, changed)
}

/// Storage for per-space configuration.
#[async_trait]
pub trait SpaceStore: Send + Sync {
    async fn load(&self, space: &SubscriberId) -> Result<Option<SpaceConfig>, StoreError>;

    async fn save(&self, space: &SubscriberId, config: &SpaceConfig) -> Result<(), StoreError>;

    /// Read-modify-write of one space, atomic with respect to every other
    /// store operation.
    ///
    /// An unknown space starts from [`SpaceConfig::default`] and is only
    /// created if the edit changes it. Nothing is written when the edit is a
    /// no-op. Returns the configuration as it is now stored.
    async fn update(&self, space: &SubscriberId, edit: SpaceEdit) -> Result<SpaceConfig, StoreError>;

    /// Deletes a space. Returns `false` if it was unknown.
    async fn remove(&self, space: &SubscriberId) -> Result<bool, StoreError>;

    /// Lists every stored space with its configuration.
    async fn spaces(&self) -> Result<Vec<(SubscriberId, SpaceConfig)>, StoreError>;
}

/// Volatile store for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    spaces: RwLock<HashMap<SubscriberId, SpaceConfig>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SpaceStore for MemoryStore {
    async fn load(&self, space: &SubscriberId) -> Result<Option<SpaceConfig>, StoreError> {
        Ok(self.spaces.read().await.get(space).cloned())
    }

    async fn save(&self, space: &SubscriberId, config: &SpaceConfig) -> Result<(), StoreError> {
        self.spaces
            .write()
            .await
            .insert(space.clone(), config.clone());
        Ok(())
    }

    async fn update(&self, space: &SubscriberId, edit: SpaceEdit) -> Result<SpaceConfig, StoreError> {
        let mut spaces = self.spaces.write().await;
        let (config, changed) = apply_edit(spaces.get(space), edit);
        if changed {
            spaces.insert(space.clone(), config.clone());
        }
        Ok(config)
    }

    async fn remove(&self, space: &SubscriberId) -> Result<bool, StoreError> {
        Ok(self.spaces.write().await.remove(space).is_some())
    }

    async fn spaces(&self) -> Result<Vec<(SubscriberId, SpaceConfig)>, StoreError> {
        Ok(self
            .spaces
            .read()
            .await
            .iter()
            .map(|(space, config)| (space.clone(), config.clone()))
            .collect())
    }
}

/// Store keeping every space in one JSON document.
///
/// The document is read once at open and rewritten in full on every change,
/// through a temporary file and a rename so a crash never leaves it half
/// written.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    spaces: Mutex<BTreeMap<SubscriberId, SpaceConfig>>,
}

impl JsonFileStore {
    /// Opens the store at `path`, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory or file cannot be accessed,
    /// and [`StoreError::Corrupt`] if the file is not a valid document.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }

        let spaces = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                path: path.clone(),
                message: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        info!(path = %path.display(), spaces = spaces.len(), "Space store opened");

        Ok(Self {
            path,
            spaces: Mutex::new(spaces),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, spaces: &BTreeMap<SubscriberId, SpaceConfig>) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(spaces).map_err(|e| StoreError::Corrupt {
            path: self.path.clone(),
            message: e.to_string(),
        })?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;

        debug!(path = %self.path.display(), spaces = spaces.len(), "Space store written");
        Ok(())
    }
}

#[async_trait]
impl SpaceStore for JsonFileStore {
    async fn load(&self, space: &SubscriberId) -> Result<Option<SpaceConfig>, StoreError> {
        Ok(self.spaces.lock().await.get(space).cloned())
    }

    async fn save(&self, space: &SubscriberId, config: &SpaceConfig) -> Result<(), StoreError> {
        let mut spaces = self.spaces.lock().await;
        let previous = spaces.insert(space.clone(), config.clone());

        if let Err(e) = self.persist(&spaces).await {
            match previous {
                Some(previous) => spaces.insert(space.clone(), previous),
                None => spaces.remove(space),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn update(&self, space: &SubscriberId, edit: SpaceEdit) -> Result<SpaceConfig, StoreError> {
        let mut spaces = self.spaces.lock().await;
        let (config, changed) = apply_edit(spaces.get(space), edit);
        if !changed {
            return Ok(config);
        }

        let previous = spaces.insert(space.clone(), config.clone());
        if let Err(e) = self.persist(&spaces).await {
            match previous {
                Some(previous) => spaces.insert(space.clone(), previous),
                None => spaces.remove(space),
            };
            return Err(e);
        }
        Ok(config)
    }

    async fn remove(&self, space: &SubscriberId) -> Result<bool, StoreError> {
        let mut spaces = self.spaces.lock().await;
        let Some(previous) = spaces.remove(space) else {
            return Ok(false);
        };

        if let Err(e) = self.persist(&spaces).await {
            spaces.insert(space.clone(), previous);
            return Err(e);
        }
        Ok(true)
    }

    async fn spaces(&self) -> Result<Vec<(SubscriberId, SpaceConfig)>, StoreError> {
        Ok(self
            .spaces
            .lock()
            .await
            .iter()
            .map(|(space, config)| (space.clone(), config.clone()))
            .collect())
    }
}
