//! User settings and the key-value store backing them
//!
//! The store is deliberately dumb (JSON values by key) so the same data
//! can be read by whatever UI sits on top of the listener. Read failures
//! fall back to defaults; nothing here may block notification delivery.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const SETTINGS_KEY: &str = "settings";
pub const CONNECTION_STATUS_KEY: &str = "connectionStatus";

/// User-controlled notification preferences
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Global toggle
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Show `idle_prompt` events
    #[serde(default = "default_true")]
    pub notify_on_idle: bool,
    /// Show `stop` events
    #[serde(default = "default_true")]
    pub notify_on_stop: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            notify_on_idle: true,
            notify_on_stop: true,
        }
    }
}

impl Settings {
    /// Load from the store, falling back to defaults on any failure
    pub async fn load(store: &dyn KeyValueStore) -> Self {
        match store.get(SETTINGS_KEY).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|e| {
                tracing::warn!("Stored settings are invalid, using defaults: {}", e);
                Self::default()
            }),
            Ok(None) => Self::default(),
            Err(e) => {
                tracing::warn!("Failed to read settings, using defaults: {:#}", e);
                Self::default()
            }
        }
    }

    pub async fn save(&self, store: &dyn KeyValueStore) -> Result<()> {
        store.set(SETTINGS_KEY, serde_json::to_value(self)?).await
    }
}

/// Async key-value storage that survives listener restarts
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
}

/// JSON object on disk, one key per top-level field
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process
    write_lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Map<String, Value>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        }
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.read_all().await?.remove(key))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        // A corrupt file is replaced rather than blocking every later write
        let mut all = self.read_all().await.unwrap_or_default();
        all.insert(key.to_string(), value);

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create store directory")?;
        }
        let content = serde_json::to_vec_pretty(&all)?;
        tokio::fs::write(&self.path, content)
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.values.lock().insert(key.to_string(), value);
        Ok(())
    }
}
