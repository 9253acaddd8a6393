//! Result-store backend abstraction.
//!
//! The executor persists all durable state (submissions, stage and task
//! records, cache entries, leases, queue items) through the [`StoreBackend`]
//! contract:
//!
//! - Conditional writes with preconditions (the CAS primitive every
//!   higher-level invariant is built on)
//! - Prefix scans for boot-time recovery
//! - Object metadata with an opaque version token
//!
//! Two backends are provided: [`MemoryBackend`] for tests and
//! [`FsBackend`], a directory-backed store for single-host deployments.
//! `FsBackend` frames every value as length-prefixed JSON and writes via a
//! temp file + rename so a crash never leaves a torn record.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Precondition for conditional writes (CAS operations).
#[derive(Debug, Clone)]
pub enum WritePrecondition {
    /// Write only if the key does not exist.
    DoesNotExist,
    /// Write only if the key's version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone)]
pub enum WriteResult {
    /// Write succeeded, returns the new version token.
    Success {
        /// The new version token after the write.
        version: String,
    },
    /// Precondition failed, returns the current version token.
    PreconditionFailed {
        /// The version that caused the precondition to fail ("0" when the
        /// key does not exist).
        current_version: String,
    },
}

impl WriteResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Metadata about a stored value.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Key of the value.
    pub key: String,
    /// Payload size in bytes (framing excluded).
    pub size: u64,
    /// Opaque version token for CAS operations.
    pub version: String,
    /// Last modification timestamp.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Storage backend trait for the result store.
///
/// All methods are `Send + Sync` so the coordinator, orchestrators, the
/// queue, and the cache manager can share one backend. Precondition
/// failures are normal results, never errors.
#[async_trait]
pub trait StoreBackend: Send + Sync + 'static {
    /// Reads an entire value.
    ///
    /// Returns `Error::NotFound` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Writes a value with an optional precondition.
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Deletes a key. Idempotent: succeeds even if the key is absent.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Lists keys with the given prefix.
    ///
    /// Results are sorted by key so zero-padded numeric keys come back in
    /// id order.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Gets value metadata without reading the payload.
    ///
    /// Returns `None` if the key does not exist.
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>>;
}

// ============================================================================
// MemoryBackend
// ============================================================================

/// In-memory backend for testing.
///
/// Thread-safe via `RwLock`; versions are numeric counters exposed as
/// opaque strings, matching the filesystem backend's behavior.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    values: Arc<RwLock<HashMap<String, StoredValue>>>,
}

#[derive(Debug, Clone)]
struct StoredValue {
    data: Bytes,
    version: u64,
    last_modified: DateTime<Utc>,
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_poisoned<T>(_: T) -> Error {
    Error::Internal {
        message: "store lock poisoned".into(),
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Bytes> {
        let values = self.values.read().map_err(lock_poisoned)?;
        values
            .get(key)
            .map(|v| v.data.clone())
            .ok_or_else(|| Error::NotFound(format!("key not found: {key}")))
    }

    async fn put(
        &self,
        key: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut values = self.values.write().map_err(lock_poisoned)?;
        let current = values.get(key);

        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(value) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: value.version.to_string(),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => {
                let expected: u64 = expected.parse().unwrap_or(u64::MAX);
                match current {
                    Some(value) if value.version != expected => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: value.version.to_string(),
                        });
                    }
                    None => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: "0".to_string(),
                        });
                    }
                    _ => {}
                }
            }
            WritePrecondition::None => {}
        }

        let version = current.map_or(1, |v| v.version + 1);
        values.insert(
            key.to_string(),
            StoredValue {
                data,
                version,
                last_modified: Utc::now(),
            },
        );
        drop(values);

        Ok(WriteResult::Success {
            version: version.to_string(),
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values.write().map_err(lock_poisoned)?.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let values = self.values.read().map_err(lock_poisoned)?;
        let mut metas: Vec<ObjectMeta> = values
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(key, value)| ObjectMeta {
                key: key.clone(),
                size: value.data.len() as u64,
                version: value.version.to_string(),
                last_modified: Some(value.last_modified),
            })
            .collect();
        metas.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(metas)
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        let values = self.values.read().map_err(lock_poisoned)?;
        Ok(values.get(key).map(|value| ObjectMeta {
            key: key.to_string(),
            size: value.data.len() as u64,
            version: value.version.to_string(),
            last_modified: Some(value.last_modified),
        }))
    }
}

// ============================================================================
// FsBackend
// ============================================================================

/// Header framing for filesystem values: version then payload length, both
/// big-endian u64. The payload that follows is JSON.
const HEADER_LEN: usize = 16;

/// Filesystem-backed store for single-host deployments.
///
/// Each key maps to a file under the state directory; the key's `/`
/// separators become subdirectories. Writes go to a temp file in the same
/// directory and are renamed into place, so readers never observe a torn
/// value and a crash mid-write leaves the previous version intact.
///
/// Mutations are serialized by an in-process lock; the precondition check
/// and the rename happen under the same critical section, which is what
/// makes `put` a true compare-and-set on a single host.
#[derive(Debug)]
pub struct FsBackend {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FsBackend {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            Error::storage_with_source(format!("create state directory {}", root.display()), e)
        })?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Returns the state directory this backend is rooted at.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.split('/').any(|part| {
            part.is_empty() || part == "." || part == ".." || part.contains('\\')
        }) {
            return Err(Error::InvalidInput(format!("invalid store key: {key:?}")));
        }
        Ok(self.root.join(key))
    }

    fn encode(version: u64, payload: &[u8]) -> Vec<u8> {
        let mut framed = Vec::with_capacity(HEADER_LEN + payload.len());
        framed.extend_from_slice(&version.to_be_bytes());
        framed.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        framed.extend_from_slice(payload);
        framed
    }

    fn decode(key: &str, framed: &[u8]) -> Result<(u64, Bytes)> {
        if framed.len() < HEADER_LEN {
            return Err(Error::storage(format!("truncated value for {key}")));
        }
        let version = u64::from_be_bytes(
            framed[0..8]
                .try_into()
                .map_err(|_| Error::storage(format!("corrupt header for {key}")))?,
        );
        let len = u64::from_be_bytes(
            framed[8..16]
                .try_into()
                .map_err(|_| Error::storage(format!("corrupt header for {key}")))?,
        );
        let payload = &framed[HEADER_LEN..];
        if payload.len() as u64 != len {
            return Err(Error::storage(format!(
                "length mismatch for {key}: header {len}, payload {}",
                payload.len()
            )));
        }
        Ok((version, Bytes::copy_from_slice(payload)))
    }

    async fn read_framed(&self, key: &str) -> Result<Option<(u64, Bytes, DateTime<Utc>)>> {
        let path = self.path_for(key)?;
        let framed = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::storage_with_source(format!("read {key}"), e)),
        };
        let modified = tokio::fs::metadata(&path)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(Utc::now);
        let (version, payload) = Self::decode(key, &framed)?;
        Ok(Some((version, payload, modified)))
    }

    fn collect_keys(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                Self::collect_keys(&path, out)?;
            } else if path.extension().is_none_or(|ext| ext != "tmp") {
                out.push(path);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StoreBackend for FsBackend {
    async fn get(&self, key: &str) -> Result<Bytes> {
        match self.read_framed(key).await? {
            Some((_, payload, _)) => Ok(payload),
            None => Err(Error::NotFound(format!("key not found: {key}"))),
        }
    }

    async fn put(
        &self,
        key: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.lock().await;

        let current = self.read_framed(key).await?;
        match &precondition {
            WritePrecondition::DoesNotExist => {
                if let Some((version, _, _)) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: version.to_string(),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => {
                let expected: u64 = expected.parse().unwrap_or(u64::MAX);
                match current {
                    Some((version, _, _)) if version != expected => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: version.to_string(),
                        });
                    }
                    None => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: "0".to_string(),
                        });
                    }
                    _ => {}
                }
            }
            WritePrecondition::None => {}
        }

        let version = current.map_or(1, |(v, _, _)| v + 1);
        let framed = Self::encode(version, &data);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage_with_source(format!("create parent for {key}"), e))?;
        }

        // Temp file lives beside the target so the rename stays on one
        // filesystem and is atomic.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &framed)
            .await
            .map_err(|e| Error::storage_with_source(format!("write {key}"), e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::storage_with_source(format!("commit {key}"), e))?;

        Ok(WriteResult::Success {
            version: version.to_string(),
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage_with_source(format!("delete {key}"), e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let root = self.root.clone();
        let mut paths = Vec::new();
        match Self::collect_keys(&root, &mut paths) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::storage_with_source("list state directory", e)),
        }

        let mut metas = Vec::new();
        for path in paths {
            let Ok(relative) = path.strip_prefix(&root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if !key.starts_with(prefix) {
                continue;
            }
            if let Some((version, payload, modified)) = self.read_framed(&key).await? {
                metas.push(ObjectMeta {
                    key,
                    size: payload.len() as u64,
                    version: version.to_string(),
                    last_modified: Some(modified),
                });
            }
        }
        metas.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(metas)
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        Ok(self.read_framed(key).await?.map(|(version, payload, modified)| ObjectMeta {
            key: key.to_string(),
            size: payload.len() as u64,
            version: version.to_string(),
            last_modified: Some(modified),
        }))
    }
}
