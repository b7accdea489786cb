//! Namespaced key-value store.
//!
//! Values are JSON documents grouped in sections (`room`, `users`). The
//! directory backend keeps one file per key under `<root>/<section>/`; the
//! memory backend is used by tests.

use std::borrow::Cow;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// Bytes left as-is in file names; everything else is `%XX`.
const KEY_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt entry {section}/{key}: {source}")]
    Corrupt {
        section: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode entry {section}/{key}: {source}")]
    Encode {
        section: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

enum Backend {
    Dir(PathBuf),
    Memory(Mutex<HashMap<(String, String), String>>),
}

#[derive(Clone)]
pub struct Store {
    backend: Arc<Backend>,
}

impl Store {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self {
            backend: Arc::new(Backend::Dir(root.into())),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            backend: Arc::new(Backend::Memory(Mutex::new(HashMap::new()))),
        }
    }

    pub fn section(&self, name: &'static str) -> Section {
        Section {
            store: self.clone(),
            name,
        }
    }
}

/// One namespace of a [`Store`].
#[derive(Clone)]
pub struct Section {
    store: Store,
    name: &'static str,
}

impl Section {
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let Some(raw) = self.get_raw(key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                section: self.name.to_string(),
                key: key.to_string(),
                source,
            })
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value).map_err(|source| StoreError::Encode {
            section: self.name.to_string(),
            key: key.to_string(),
            source,
        })?;
        self.set_raw(key, &raw).await
    }

    /// All decodable entries. Corrupt ones are logged and skipped.
    pub async fn entries<T: DeserializeOwned>(&self) -> Result<Vec<(String, T)>, StoreError> {
        let mut entries = Vec::new();
        for (key, raw) in self.list_raw().await? {
            match serde_json::from_str(&raw) {
                Ok(value) => entries.push((key, value)),
                Err(err) => warn!(section = self.name, key = %key, %err, "skipping corrupt entry"),
            }
        }
        Ok(entries)
    }

    pub async fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        match &*self.store.backend {
            Backend::Memory(map) => Ok(map
                .lock()
                .get(&(self.name.to_string(), key.to_string()))
                .cloned()),
            Backend::Dir(root) => {
                let path = entry_path(root, self.name, key);
                match tokio::fs::read_to_string(&path).await {
                    Ok(raw) => Ok(Some(raw)),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
                    Err(source) => Err(StoreError::Io { path, source }),
                }
            }
        }
    }

    pub async fn set_raw(&self, key: &str, raw: &str) -> Result<(), StoreError> {
        match &*self.store.backend {
            Backend::Memory(map) => {
                map.lock()
                    .insert((self.name.to_string(), key.to_string()), raw.to_string());
                Ok(())
            }
            Backend::Dir(root) => {
                let dir = root.join(self.name);
                tokio::fs::create_dir_all(&dir)
                    .await
                    .map_err(|source| StoreError::Io {
                        path: dir.clone(),
                        source,
                    })?;
                let path = entry_path(root, self.name, key);
                // Write-then-rename so readers never see a torn file.
                let staging = dir.join(format!(".{}.{}.tmp", encode_key(key), uuid::Uuid::new_v4()));
                tokio::fs::write(&staging, raw)
                    .await
                    .map_err(|source| StoreError::Io {
                        path: staging.clone(),
                        source,
                    })?;
                tokio::fs::rename(&staging, &path)
                    .await
                    .map_err(|source| StoreError::Io { path, source })
            }
        }
    }

    async fn list_raw(&self) -> Result<Vec<(String, String)>, StoreError> {
        match &*self.store.backend {
            Backend::Memory(map) => Ok(map
                .lock()
                .iter()
                .filter(|((section, _), _)| section == self.name)
                .map(|((_, key), raw)| (key.clone(), raw.clone()))
                .collect()),
            Backend::Dir(root) => {
                let dir = root.join(self.name);
                let mut listing = match tokio::fs::read_dir(&dir).await {
                    Ok(listing) => listing,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
                    Err(source) => return Err(StoreError::Io { path: dir, source }),
                };
                let mut entries = Vec::new();
                loop {
                    let entry = listing.next_entry().await.map_err(|source| StoreError::Io {
                        path: dir.clone(),
                        source,
                    })?;
                    let Some(entry) = entry else { break };
                    let file_name = entry.file_name();
                    let Some(key) = file_name
                        .to_str()
                        .and_then(|name| name.strip_suffix(".json"))
                        .and_then(decode_key)
                    else {
                        continue;
                    };
                    let path = entry.path();
                    let raw = tokio::fs::read_to_string(&path)
                        .await
                        .map_err(|source| StoreError::Io { path, source })?;
                    entries.push((key, raw));
                }
                Ok(entries)
            }
        }
    }
}

fn entry_path(root: &Path, section: &str, key: &str) -> PathBuf {
    root.join(section).join(format!("{}.json", encode_key(key)))
}

fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, KEY_SET).to_string()
}

fn decode_key(encoded: &str) -> Option<String> {
    percent_decode_str(encoded)
        .decode_utf8()
        .ok()
        .map(Cow::into_owned)
}
