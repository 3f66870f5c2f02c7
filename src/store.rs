//! Persisted record of the content key currently shown on the surface.
//!
//! Written only after a render is confirmed, read at startup so that a
//! restart does not redraw content that is already physically on the panel.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt key record at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Where the displayed content key lives.
pub trait KeyStore: Send + Sync {
    /// The key of the content currently displayed, if any.
    fn current(&self) -> Option<String>;

    /// Record `key` as displayed.
    fn record(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyRecord {
    content_key: String,
    recorded_at: u64,
}

/// JSON-file backed store. The file is replaced atomically on each write.
pub struct FileKeyStore {
    path: PathBuf,
    cached: RwLock<Option<String>>,
}

impl FileKeyStore {
    /// Open the store, reading any existing record. A missing file means
    /// nothing is displayed; a corrupt one is an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let cached = match std::fs::read(&path) {
            Ok(bytes) => {
                let record: KeyRecord =
                    serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                        path: path.clone(),
                        source,
                    })?;
                tracing::info!(key = %record.content_key, "restored displayed content key");
                Some(record.content_key)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        Ok(Self {
            path,
            cached: RwLock::new(cached),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_record(&self, key: &str) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        let recorded_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let record = KeyRecord {
            content_key: key.to_string(),
            recorded_at,
        };
        let bytes = serde_json::to_vec_pretty(&record).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }
}

impl KeyStore for FileKeyStore {
    fn current(&self) -> Option<String> {
        self.cached.read().clone()
    }

    fn record(&self, key: &str) -> Result<(), StoreError> {
        self.write_record(key)?;
        *self.cached.write() = Some(key.to_string());
        Ok(())
    }
}

/// In-memory store. Keeps every recorded key, in order.
#[derive(Default)]
pub struct MemoryKeyStore {
    history: Mutex<Vec<String>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start out as if `key` were already displayed.
    pub fn with_current(key: &str) -> Self {
        Self {
            history: Mutex::new(vec![key.to_string()]),
        }
    }

    pub fn recorded(&self) -> Vec<String> {
        self.history.lock().clone()
    }
}

impl KeyStore for MemoryKeyStore {
    fn current(&self) -> Option<String> {
        self.history.lock().last().cloned()
    }

    fn record(&self, key: &str) -> Result<(), StoreError> {
        self.history.lock().push(key.to_string());
        Ok(())
    }
}
