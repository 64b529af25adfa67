//! Durable run-state persistence for leadsync.
//!
//! Every step invocation may run in a fresh process, so the orchestrator
//! round-trips its whole [`RunState`] through a store on each call.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use leadsync_core::RunState;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadsync-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing run state: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("run state store unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
pub trait RunStateStore: Send + Sync {
    /// Returns the persisted state, or `None` when it is missing or unreadable.
    async fn load(&self) -> Option<RunState>;

    async fn save(&self, state: &RunState) -> Result<(), StorageError>;

    async fn clear(&self) -> Result<(), StorageError>;
}

/// Single JSON file replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileRunStateStore {
    path: PathBuf,
}

impl FileRunStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RunStateStore for FileRunStateStore {
    async fn load(&self) -> Option<RunState> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "run state unreadable; treating as absent");
                return None;
            }
        };
        match serde_json::from_str::<RunState>(&text) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "run state corrupt; treating as absent");
                None
            }
        }
    }

    async fn save(&self, state: &RunState) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(state)?;
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| StorageError::io("creating state directory", &parent, e))?;

        let temp_path = parent.join(format!(".run-state.{}.tmp", Uuid::new_v4()));
        let write_result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await
                .map_err(|e| StorageError::io("opening temp state file", &temp_path, e))?;
            file.write_all(&bytes)
                .await
                .map_err(|e| StorageError::io("writing temp state file", &temp_path, e))?;
            file.flush()
                .await
                .map_err(|e| StorageError::io("flushing temp state file", &temp_path, e))?;
            drop(file);
            fs::rename(&temp_path, &self.path)
                .await
                .map_err(|e| StorageError::io("replacing state file", &self.path, e))
        }
        .await;

        if write_result.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        } else {
            debug!(path = %self.path.display(), bytes = bytes.len(), "run state saved");
        }
        write_result
    }

    async fn clear(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::io("removing state file", &self.path, err)),
        }
    }
}

/// In-process store that still serializes, so state round-trips like the file store.
#[derive(Debug, Default)]
pub struct MemoryRunStateStore {
    payload: Mutex<Option<String>>,
    fail_saves: AtomicBool,
}

impl MemoryRunStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent saves fail until switched back off.
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub async fn raw(&self) -> Option<String> {
        self.payload.lock().await.clone()
    }

    pub async fn put_raw(&self, payload: impl Into<String>) {
        *self.payload.lock().await = Some(payload.into());
    }
}

#[async_trait]
impl RunStateStore for MemoryRunStateStore {
    async fn load(&self) -> Option<RunState> {
        let payload = self.payload.lock().await;
        let text = payload.as_deref()?;
        match serde_json::from_str(text) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(error = %err, "in-memory run state corrupt; treating as absent");
                None
            }
        }
    }

    async fn save(&self, state: &RunState) -> Result<(), StorageError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory store rejecting writes".into()));
        }
        let text = serde_json::to_string(state)?;
        *self.payload.lock().await = Some(text);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        *self.payload.lock().await = None;
        Ok(())
    }
}
