//! Object storage wrapper
//!
//! Thin, total interface over the `object_store` crate: the rest of the
//! system sees `list` / `get` / `put` / `mirror` / `pull` / `move_object`
//! / `delete` / `exists` and nothing else. Transient transport errors are
//! retried here with exponential backoff; business logic never retries.
//! `mirror` and `pull` are multi-object and therefore not atomic — callers
//! tolerate partial mirrors because every input they move is idempotent.

pub mod layout;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use object_store::{ObjectStore, path::Path as StoragePath};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{StoreConfig, StoreProvider};
use crate::job::sanitize_rel_path;

/// Attempts per operation before a transport error surfaces.
const MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("store {op} failed after {attempts} attempts: {source}")]
    Transport {
        op: &'static str,
        attempts: u32,
        source: object_store::Error,
    },

    #[error("store configuration invalid: {0}")]
    Config(String),

    #[error("local io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Outcome of a copy-then-delete move. The delete step is where a claim
/// race resolves: losing it means another worker already took the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved,
    SourceMissing,
}

/// Storage client wrapping any `object_store` backend.
#[derive(Clone)]
pub struct StoreClient {
    store: Arc<dyn ObjectStore>,
    pub bucket: String,
}

impl StoreClient {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: String) -> Self {
        Self { store, bucket }
    }

    /// In-memory backend for tests and local development.
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(object_store::memory::InMemory::new()),
            bucket: "farmhand-local".to_string(),
        }
    }

    /// Build a client from configuration: S3-compatible remote, local
    /// filesystem directory, or in-memory.
    pub fn from_config(cfg: &StoreConfig) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match cfg.provider {
            StoreProvider::Memory => Arc::new(object_store::memory::InMemory::new()),
            StoreProvider::Local => {
                let root = PathBuf::from(&cfg.bucket);
                std::fs::create_dir_all(&root)?;
                Arc::new(
                    object_store::local::LocalFileSystem::new_with_prefix(&root)
                        .map_err(|e| StoreError::Config(e.to_string()))?,
                )
            }
            StoreProvider::S3 => {
                let mut builder = object_store::aws::AmazonS3Builder::new()
                    .with_bucket_name(&cfg.bucket);
                if let Some(endpoint) = &cfg.endpoint {
                    builder = builder.with_endpoint(endpoint);
                }
                if let Some(region) = &cfg.region {
                    builder = builder.with_region(region);
                }
                if let Some(access_key) = &cfg.access_key {
                    builder = builder.with_access_key_id(access_key);
                }
                if let Some(secret_key) = &cfg.secret_key {
                    builder = builder.with_secret_access_key(secret_key);
                }
                Arc::new(builder.build().map_err(|e| StoreError::Config(e.to_string()))?)
            }
        };

        Ok(Self::new(store, cfg.bucket.clone()))
    }

    /// List all keys under a prefix, sorted.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let store = self.store.clone();
        let path = StoragePath::from(prefix);
        with_retry("list", || {
            let store = store.clone();
            let path = path.clone();
            async move {
                let mut stream = store.list(Some(&path));
                let mut keys = Vec::new();
                while let Some(meta) = stream.next().await.transpose()? {
                    keys.push(meta.location.to_string());
                }
                keys.sort();
                Ok(keys)
            }
        })
        .await
    }

    /// First key under a prefix, if any. Cheaper than a full listing when
    /// the caller only needs an emptiness probe.
    pub async fn first_key(&self, prefix: &str) -> Result<Option<String>> {
        let store = self.store.clone();
        let path = StoragePath::from(prefix);
        with_retry("list", || {
            let store = store.clone();
            let path = path.clone();
            async move {
                let mut stream = store.list(Some(&path));
                Ok(stream
                    .next()
                    .await
                    .transpose()?
                    .map(|meta| meta.location.to_string()))
            }
        })
        .await
    }

    /// Download a single object.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let store = self.store.clone();
        let path = StoragePath::from(key);
        let bytes = with_retry("get", || {
            let store = store.clone();
            let path = path.clone();
            async move { store.get(&path).await?.bytes().await }
        })
        .await?;
        debug!(key, size = bytes.len(), "downloaded object");
        Ok(bytes.to_vec())
    }

    /// Upload a single object, replacing any existing one.
    pub async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let store = self.store.clone();
        let path = StoragePath::from(key);
        let size = data.len();
        with_retry("put", || {
            let store = store.clone();
            let path = path.clone();
            let data = data.clone();
            async move { store.put(&path, data.into()).await.map(|_| ()) }
        })
        .await?;
        debug!(key, size, "uploaded object");
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let store = self.store.clone();
        let path = StoragePath::from(key);
        with_retry("delete", || {
            let store = store.clone();
            let path = path.clone();
            async move { store.delete(&path).await }
        })
        .await
    }

    /// Existence probe via a HEAD request.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let store = self.store.clone();
        let path = StoragePath::from(key);
        let result = with_retry("head", || {
            let store = store.clone();
            let path = path.clone();
            async move { store.head(&path).await }
        })
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Last-modified timestamp of an object. Used for stale-claim and
    /// reap decisions.
    pub async fn modified_at(&self, key: &str) -> Result<DateTime<Utc>> {
        let store = self.store.clone();
        let path = StoragePath::from(key);
        let meta = with_retry("head", || {
            let store = store.clone();
            let path = path.clone();
            async move { store.head(&path).await }
        })
        .await?;
        Ok(meta.last_modified)
    }

    /// Server-side move implemented as copy-then-delete.
    ///
    /// Two workers can both pass the copy step for the same source; the
    /// delete step disambiguates. `SourceMissing` means the other worker
    /// won and the caller must discard the job.
    pub async fn move_object(&self, src: &str, dst: &str) -> Result<MoveOutcome> {
        let store = self.store.clone();
        let from = StoragePath::from(src);
        let to = StoragePath::from(dst);

        let copied = with_retry("copy", || {
            let store = store.clone();
            let from = from.clone();
            let to = to.clone();
            async move { store.copy(&from, &to).await }
        })
        .await;

        match copied {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => return Ok(MoveOutcome::SourceMissing),
            Err(e) => return Err(e),
        }

        let deleted = with_retry("delete", || {
            let store = store.clone();
            let from = from.clone();
            async move { store.delete(&from).await }
        })
        .await;

        match deleted {
            Ok(()) => Ok(MoveOutcome::Moved),
            Err(StoreError::NotFound(_)) => Ok(MoveOutcome::SourceMissing),
            Err(e) => Err(e),
        }
    }

    /// Recursive idempotent upload of a local directory tree under a
    /// prefix. Unchanged files (same size) are skipped, which makes the
    /// per-submit script sync cheap.
    pub async fn mirror(&self, local: &Path, prefix: &str) -> Result<usize> {
        let mut uploaded = 0;
        for file in walk_files(local)? {
            let rel = relative_key(local, &file)?;
            let key = format!("{prefix}/{rel}");
            let data = std::fs::read(&file)?;

            if let Some(remote_size) = self.size_of(&key).await? {
                if remote_size == data.len() as u64 {
                    continue;
                }
            }

            self.put(&key, data).await?;
            uploaded += 1;
        }
        debug!(prefix, uploaded, "mirrored directory to store");
        Ok(uploaded)
    }

    /// Recursive download of a prefix into a local directory. Files
    /// already present with the right size are skipped. Returns the
    /// prefix-relative paths of everything now present locally.
    pub async fn pull(&self, prefix: &str, local: &Path) -> Result<Vec<String>> {
        let keys = self.list(prefix).await?;
        let mut pulled = Vec::with_capacity(keys.len());

        for key in keys {
            let Some(rel) = key.strip_prefix(prefix).and_then(|r| r.strip_prefix('/')) else {
                continue;
            };
            // Keys come from our own listing, but a hostile bucket must not
            // be able to write outside the target directory.
            if sanitize_rel_path(rel).is_err() {
                warn!(key, "skipping object with unsafe key");
                continue;
            }

            let dest = local.join(rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let skip = match (std::fs::metadata(&dest), self.size_of(&key).await?) {
                (Ok(meta), Some(remote)) => meta.len() == remote,
                _ => false,
            };
            if !skip {
                let data = self.get(&key).await?;
                std::fs::write(&dest, data)?;
            }
            pulled.push(rel.to_string());
        }

        Ok(pulled)
    }

    async fn size_of(&self, key: &str) -> Result<Option<u64>> {
        let store = self.store.clone();
        let path = StoragePath::from(key);
        let result = with_retry("head", || {
            let store = store.clone();
            let path = path.clone();
            async move { store.head(&path).await }
        })
        .await;

        match result {
            Ok(meta) => Ok(Some(meta.size)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Retry a store operation with exponential backoff (1s, 2s, 4s, 8s).
/// `NotFound` is terminal and surfaces immediately; everything else is
/// treated as transient until attempts are exhausted.
async fn with_retry<T, F, Fut>(op: &'static str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, object_store::Error>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(object_store::Error::NotFound { path, .. }) => {
                return Err(StoreError::NotFound(path));
            }
            Err(source) if attempt >= MAX_ATTEMPTS => {
                warn!(op, attempt, error = %source, "store operation failed, giving up");
                return Err(StoreError::Transport {
                    op,
                    attempts: attempt,
                    source,
                });
            }
            Err(source) => {
                warn!(op, attempt, error = %source, "store operation failed, retrying");
                let backoff = Duration::from_secs(2u64.pow(attempt - 1));
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

fn walk_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn relative_key(root: &Path, file: &Path) -> Result<String> {
    let rel = file
        .strip_prefix(root)
        .map_err(|_| StoreError::Config(format!("{} escapes {}", file.display(), root.display())))?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component.as_os_str().to_str() {
            Some(s) => parts.push(s),
            None => {
                return Err(StoreError::Config(format!(
                    "non-utf8 path component in {}",
                    file.display()
                )));
            }
        }
    }
    Ok(parts.join("/"))
}
