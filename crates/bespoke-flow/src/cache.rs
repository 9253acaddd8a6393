//! Content-addressed cache with fingerprint leases.
//!
//! The cache manager is the only mutator of cache entries and leases.
//! Everything else goes through four operations:
//!
//! - **lookup**: read a published entry
//! - **acquire**: atomically either hit the cache, observe another owner's
//!   lease, or install a lease and win the right to compute
//! - **publish**: insert the entry and release the lease (ownership
//!   checked; a stale publish is rejected and the value discarded)
//! - **release**: give the lease up without publishing so a waiter can
//!   re-acquire
//!
//! The concurrency contract this enforces: at most one task per
//! fingerprint is in-flight system-wide while its lease is valid. Leases
//! carry a deadline; a lease whose owner stops heartbeating is taken over
//! via compare-and-set on the persisted record, so a crashed worker can
//! never wedge a fingerprint forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use bespoke_core::{keys, StoreBackend, TaskId, WorkerId, WritePrecondition, WriteResult};

use crate::documents::StageOutput;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;

/// Default lease time-to-live (5 minutes).
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(300);

/// A published cache entry.
///
/// Entries are insert-once: they are never mutated, only purged
/// explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The fingerprint this entry is stored under.
    pub fingerprint: Fingerprint,
    /// The stage output document.
    pub output: StageOutput,
    /// Worker that produced the value, if it was computed (not purged and
    /// re-imported).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produced_by: Option<WorkerId>,
    /// When the computation finished.
    pub finished_at: DateTime<Utc>,
    /// Serialized size of the output document in bytes.
    pub size: u64,
}

/// A persisted lease record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Owning task id.
    pub owner: String,
    /// Deadline after which the lease may be broken.
    pub deadline: DateTime<Utc>,
}

impl LeaseRecord {
    fn new(owner: &TaskId, ttl: Duration) -> Self {
        Self {
            owner: owner.to_string(),
            deadline: Utc::now()
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(300)),
        }
    }

    /// Returns true if the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.deadline
    }
}

/// Outcome of an acquire call.
#[derive(Debug)]
pub enum AcquireOutcome {
    /// The caller installed the lease and must compute the value.
    Granted,
    /// Another task holds a valid lease; subscribe and wait.
    HeldBy {
        /// The owning task id.
        owner: String,
    },
    /// The value is already published.
    Hit(Box<CacheEntry>),
}

/// Deduplicates stage executions by fingerprint.
pub struct CacheManager {
    backend: Arc<dyn StoreBackend>,
    ttl: Duration,
    waiters: Mutex<HashMap<String, Arc<Notify>>>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl CacheManager {
    /// Creates a cache manager over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StoreBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the configured lease TTL.
    #[must_use]
    pub const fn lease_ttl(&self) -> Duration {
        self.ttl
    }

    /// The heartbeat cadence workers should use: a third of the TTL.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        self.ttl / 3
    }

    /// Reads a published entry. A successful publish is visible to all
    /// subsequent lookups.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the backend fails.
    pub async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        match self.backend.get(&keys::cache(fingerprint.as_str())).await {
            Ok(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).map_err(bespoke_core::Error::from)?,
            )),
            Err(bespoke_core::Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically resolves a fingerprint: hit, held, or granted.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the backend fails.
    pub async fn acquire(&self, fingerprint: &Fingerprint, owner: &TaskId) -> Result<AcquireOutcome> {
        if let Some(entry) = self.lookup(fingerprint).await? {
            return Ok(AcquireOutcome::Hit(Box::new(entry)));
        }

        let lease_key = keys::lease(fingerprint.as_str());
        let lease = LeaseRecord::new(owner, self.ttl);
        let lease_bytes = Bytes::from(serde_json::to_vec(&lease).map_err(bespoke_core::Error::from)?);

        match self
            .backend
            .put(&lease_key, lease_bytes.clone(), WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => return Ok(AcquireOutcome::Granted),
            WriteResult::PreconditionFailed { .. } => {}
        }

        // A lease exists. Bind the expiry decision to the version we read
        // so a racing takeover makes our CAS fail instead of clobbering.
        let Some(meta) = self.backend.head(&lease_key).await? else {
            // Released between our write attempt and now; report held so
            // the caller re-acquires on its next consultation.
            return Ok(AcquireOutcome::HeldBy {
                owner: "unknown".to_string(),
            });
        };
        let existing: LeaseRecord = match self.backend.get(&lease_key).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(bespoke_core::Error::from)?,
            Err(bespoke_core::Error::NotFound(_)) => {
                return Ok(AcquireOutcome::HeldBy {
                    owner: "unknown".to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        if !existing.is_expired() {
            return Ok(AcquireOutcome::HeldBy {
                owner: existing.owner,
            });
        }

        tracing::warn!(
            fingerprint = %fingerprint,
            stale_owner = %existing.owner,
            "breaking expired lease"
        );
        match self
            .backend
            .put(
                &lease_key,
                lease_bytes,
                WritePrecondition::MatchesVersion(meta.version),
            )
            .await?
        {
            WriteResult::Success { .. } => Ok(AcquireOutcome::Granted),
            WriteResult::PreconditionFailed { .. } => Ok(AcquireOutcome::HeldBy {
                owner: existing.owner,
            }),
        }
    }

    /// Extends the lease deadline. Called by the worker running the task
    /// every third of the TTL.
    ///
    /// # Errors
    ///
    /// Returns `Error::LeaseLost` if the lease is gone or owned by someone
    /// else; the worker should stop and let redelivery handle the task.
    pub async fn heartbeat(&self, fingerprint: &Fingerprint, owner: &TaskId) -> Result<()> {
        let lease_key = keys::lease(fingerprint.as_str());
        let lost = || Error::LeaseLost {
            fingerprint: fingerprint.to_string(),
        };

        let meta = self.backend.head(&lease_key).await?.ok_or_else(lost)?;
        let existing: LeaseRecord = match self.backend.get(&lease_key).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(bespoke_core::Error::from)?,
            Err(bespoke_core::Error::NotFound(_)) => return Err(lost()),
            Err(e) => return Err(e.into()),
        };
        if existing.owner != owner.to_string() {
            return Err(lost());
        }

        let renewed = LeaseRecord::new(owner, self.ttl);
        let bytes = Bytes::from(serde_json::to_vec(&renewed).map_err(bespoke_core::Error::from)?);
        match self
            .backend
            .put(&lease_key, bytes, WritePrecondition::MatchesVersion(meta.version))
            .await?
        {
            WriteResult::Success { .. } => Ok(()),
            WriteResult::PreconditionFailed { .. } => Err(lost()),
        }
    }

    /// Inserts the cache entry and releases the lease, waking waiters.
    ///
    /// Returns `false` when the publish is stale (the lease expired or was
    /// taken over); the value is discarded in that case.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the backend fails.
    pub async fn publish(
        &self,
        fingerprint: &Fingerprint,
        owner: &TaskId,
        output: StageOutput,
        produced_by: WorkerId,
    ) -> Result<bool> {
        let lease_key = keys::lease(fingerprint.as_str());
        let holds_lease = match self.backend.get(&lease_key).await {
            Ok(bytes) => {
                let lease: LeaseRecord =
                    serde_json::from_slice(&bytes).map_err(bespoke_core::Error::from)?;
                lease.owner == owner.to_string()
            }
            Err(bespoke_core::Error::NotFound(_)) => false,
            Err(e) => return Err(e.into()),
        };

        if !holds_lease {
            tracing::warn!(
                fingerprint = %fingerprint,
                owner = %owner,
                "stale publish rejected; discarding value"
            );
            return Ok(false);
        }

        let output_bytes = serde_json::to_vec(&output).map_err(bespoke_core::Error::from)?;
        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            output,
            produced_by: Some(produced_by),
            finished_at: Utc::now(),
            size: output_bytes.len() as u64,
        };
        let entry_bytes =
            Bytes::from(serde_json::to_vec(&entry).map_err(bespoke_core::Error::from)?);

        // Insert-once: if a concurrent publish already landed (possible
        // after an administrative lease break), the existing entry wins.
        let _ = self
            .backend
            .put(
                &keys::cache(fingerprint.as_str()),
                entry_bytes,
                WritePrecondition::DoesNotExist,
            )
            .await?;

        self.backend.delete(&lease_key).await?;
        self.notify_waiters(fingerprint);
        Ok(true)
    }

    /// Releases the lease without publishing. Waiters wake and re-acquire;
    /// one of them is promoted to the new owner.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the backend fails. Releasing a lease the
    /// caller no longer owns is a no-op.
    pub async fn release(&self, fingerprint: &Fingerprint, owner: &TaskId) -> Result<()> {
        let lease_key = keys::lease(fingerprint.as_str());
        match self.backend.get(&lease_key).await {
            Ok(bytes) => {
                let lease: LeaseRecord =
                    serde_json::from_slice(&bytes).map_err(bespoke_core::Error::from)?;
                if lease.owner == owner.to_string() {
                    self.backend.delete(&lease_key).await?;
                }
            }
            Err(bespoke_core::Error::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.notify_waiters(fingerprint);
        Ok(())
    }

    /// Removes a published entry. The only way a cache value ever goes
    /// away.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the backend fails.
    pub async fn purge(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.backend.delete(&keys::cache(fingerprint.as_str())).await?;
        Ok(())
    }

    /// Returns the notifier for a fingerprint, creating it if needed.
    ///
    /// Waiters should pair `notified()` with a timeout and re-consult the
    /// cache on every wake: the notification is a hint, the store is the
    /// truth.
    #[must_use]
    pub fn subscribe(&self, fingerprint: &Fingerprint) -> Arc<Notify> {
        let mut waiters = self.waiters.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(
            waiters
                .entry(fingerprint.as_str().to_string())
                .or_insert_with(|| Arc::new(Notify::new())),
        )
    }

    fn notify_waiters(&self, fingerprint: &Fingerprint) {
        let notify = {
            let mut waiters = self
                .waiters
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            waiters.remove(fingerprint.as_str())
        };
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::{FragmentationOutput, StageOutput};
    use bespoke_core::MemoryBackend;

    fn manager(ttl: Duration) -> CacheManager {
        CacheManager::new(Arc::new(MemoryBackend::new()), ttl)
    }

    fn output() -> StageOutput {
        StageOutput::Fragmentation(FragmentationOutput {
            parent_smiles: "CC".into(),
            fragments: vec![],
        })
    }

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::from_hex(s)
    }

    #[tokio::test]
    async fn acquire_then_publish_then_hit() {
        let cache = manager(DEFAULT_LEASE_TTL);
        let owner = TaskId::generate();
        let fingerprint = fp("aaa");

        assert!(matches!(
            cache.acquire(&fingerprint, &owner).await.unwrap(),
            AcquireOutcome::Granted
        ));

        let published = cache
            .publish(&fingerprint, &owner, output(), WorkerId::generate())
            .await
            .unwrap();
        assert!(published);

        let other = TaskId::generate();
        assert!(matches!(
            cache.acquire(&fingerprint, &other).await.unwrap(),
            AcquireOutcome::Hit(_)
        ));
        assert!(cache.lookup(&fingerprint).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn second_acquire_observes_holder() {
        let cache = manager(DEFAULT_LEASE_TTL);
        let first = TaskId::generate();
        let second = TaskId::generate();
        let fingerprint = fp("bbb");

        assert!(matches!(
            cache.acquire(&fingerprint, &first).await.unwrap(),
            AcquireOutcome::Granted
        ));

        let AcquireOutcome::HeldBy { owner } =
            cache.acquire(&fingerprint, &second).await.unwrap()
        else {
            panic!("expected held-by");
        };
        assert_eq!(owner, first.to_string());
    }

    #[tokio::test]
    async fn stale_publish_is_rejected_and_discarded() {
        let cache = manager(DEFAULT_LEASE_TTL);
        let owner = TaskId::generate();
        let interloper = TaskId::generate();
        let fingerprint = fp("ccc");

        cache.acquire(&fingerprint, &owner).await.unwrap();

        let published = cache
            .publish(&fingerprint, &interloper, output(), WorkerId::generate())
            .await
            .unwrap();
        assert!(!published);
        assert!(cache.lookup(&fingerprint).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let cache = manager(Duration::from_millis(1));
        let crashed = TaskId::generate();
        let successor = TaskId::generate();
        let fingerprint = fp("ddd");

        assert!(matches!(
            cache.acquire(&fingerprint, &crashed).await.unwrap(),
            AcquireOutcome::Granted
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(matches!(
            cache.acquire(&fingerprint, &successor).await.unwrap(),
            AcquireOutcome::Granted
        ));

        // The original owner's publish must now be rejected.
        let published = cache
            .publish(&fingerprint, &crashed, output(), WorkerId::generate())
            .await
            .unwrap();
        assert!(!published);
    }

    #[tokio::test]
    async fn heartbeat_extends_and_detects_loss() {
        let cache = manager(Duration::from_secs(60));
        let owner = TaskId::generate();
        let fingerprint = fp("eee");

        cache.acquire(&fingerprint, &owner).await.unwrap();
        cache.heartbeat(&fingerprint, &owner).await.unwrap();

        cache.release(&fingerprint, &owner).await.unwrap();
        let err = cache.heartbeat(&fingerprint, &owner).await.unwrap_err();
        assert!(matches!(err, Error::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn release_wakes_waiters_for_reacquire() {
        let cache = Arc::new(manager(DEFAULT_LEASE_TTL));
        let first = TaskId::generate();
        let second = TaskId::generate();
        let fingerprint = fp("fff");

        cache.acquire(&fingerprint, &first).await.unwrap();

        let notify = cache.subscribe(&fingerprint);
        let waiter = tokio::spawn(async move { notify.notified().await });

        cache.release(&fingerprint, &first).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();

        // The waiter is promoted on re-acquire.
        assert!(matches!(
            cache.acquire(&fingerprint, &second).await.unwrap(),
            AcquireOutcome::Granted
        ));
    }

    #[tokio::test]
    async fn publish_after_release_without_lease_is_stale() {
        let cache = manager(DEFAULT_LEASE_TTL);
        let owner = TaskId::generate();
        let fingerprint = fp("ggg");

        cache.acquire(&fingerprint, &owner).await.unwrap();
        cache.release(&fingerprint, &owner).await.unwrap();

        let published = cache
            .publish(&fingerprint, &owner, output(), WorkerId::generate())
            .await
            .unwrap();
        assert!(!published);
    }

    #[tokio::test]
    async fn purge_removes_published_entry() {
        let cache = manager(DEFAULT_LEASE_TTL);
        let owner = TaskId::generate();
        let fingerprint = fp("hhh");

        cache.acquire(&fingerprint, &owner).await.unwrap();
        cache
            .publish(&fingerprint, &owner, output(), WorkerId::generate())
            .await
            .unwrap();
        assert!(cache.lookup(&fingerprint).await.unwrap().is_some());

        cache.purge(&fingerprint).await.unwrap();
        assert!(cache.lookup(&fingerprint).await.unwrap().is_none());
    }
}
