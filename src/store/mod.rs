// src/store/mod.rs
// Durable key-value store for cached credentials and preferences

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::state::PersistedState;

/// Every key the client persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::IntoStaticStr)]
#[strum(serialize_all = "camelCase")]
pub enum StoreKey {
    AccessToken,
    RefreshToken,
    ConfigToken,
    UserEmail,
    Onboarded,
    LowBandwidth,
    BandwidthCap,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// JSON-file backed store. Reads are served from memory; every write
/// rewrites the file atomically (temp file + rename).
pub struct Store {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl Store {
    /// Open the store at `path`.
    ///
    /// A missing file is an empty store. An unreadable or corrupt file is
    /// logged and also treated as empty: failing to read cached credentials
    /// means there are none.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<BTreeMap<String, Value>>(&text) {
                Ok(values) => values,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Store file is corrupt, starting empty");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No store file yet");
                BTreeMap::new()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read store, starting empty");
                BTreeMap::new()
            }
        };

        Self {
            path,
            values: Mutex::new(values),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: StoreKey) -> Option<Value> {
        self.lock().get(key_name(key)).cloned()
    }

    pub fn get_string(&self, key: StoreKey) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: StoreKey) -> Option<bool> {
        self.get(key)?.as_bool()
    }

    pub fn set(&self, key: StoreKey, value: Value) -> Result<(), StoreError> {
        self.set_many([(key, value)])
    }

    pub fn remove(&self, key: StoreKey) -> Result<(), StoreError> {
        let mut values = self.lock();
        if values.remove(key_name(key)).is_some() {
            self.write(&values)?;
        }
        Ok(())
    }

    /// Set several keys with a single file write.
    pub fn set_many(&self, entries: impl IntoIterator<Item = (StoreKey, Value)>) -> Result<(), StoreError> {
        let mut values = self.lock();
        for (key, value) in entries {
            values.insert(key_name(key).to_string(), value);
        }
        self.write(&values)
    }

    /// Write the durable subset of the application state.
    pub fn save(&self, persisted: &PersistedState) -> Result<(), StoreError> {
        self.set_many([
            (StoreKey::UserEmail, Value::String(persisted.email.clone())),
            (StoreKey::AccessToken, Value::String(persisted.access_token.clone())),
            (StoreKey::RefreshToken, Value::String(persisted.refresh_token.clone())),
            (StoreKey::ConfigToken, Value::String(persisted.config_token.clone())),
            (StoreKey::Onboarded, Value::Bool(persisted.onboarded)),
        ])
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
        // A poisoned lock still holds a usable map
        self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self, values: &BTreeMap<String, Value>) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let body = serde_json::to_vec_pretty(values)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp).map_err(io_err)?;
            file.write_all(&body).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }
}

fn key_name(key: StoreKey) -> &'static str {
    key.into()
}
