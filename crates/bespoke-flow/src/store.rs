//! Typed state persistence over the result store backend.
//!
//! The state store is how every durable record reaches disk: submissions,
//! stage records, and task records are serialized to JSON and written under
//! the namespaced key layout in [`bespoke_core::keys`]. Submission ids come
//! from a compare-and-set counter so concurrent submitters always observe
//! distinct, monotonically increasing ids.

use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use bespoke_core::{keys, StoreBackend, SubmissionId, TaskId, WritePrecondition, WriteResult};

use crate::error::{Error, Result};
use crate::stage::StageRecord;
use crate::submission::{Submission, SubmissionStatus};
use crate::task::TaskRecord;

/// Typed persistence layer shared by the coordinator, orchestrators, and
/// workers.
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn StoreBackend>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("backend", &"<StoreBackend>")
            .finish()
    }
}

fn to_bytes<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value).map_err(bespoke_core::Error::from)?))
}

fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes).map_err(bespoke_core::Error::from)?)
}

impl StateStore {
    /// Creates a state store over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self { backend }
    }

    /// Returns the underlying backend (the cache and queue share it).
    #[must_use]
    pub fn backend(&self) -> Arc<dyn StoreBackend> {
        Arc::clone(&self.backend)
    }

    /// Allocates the next submission id through a CAS loop on the counter
    /// key. Ids are unique across the lifetime of the store.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the backend fails.
    pub async fn allocate_submission_id(&self) -> Result<SubmissionId> {
        loop {
            let current = match self.backend.head(keys::SUBMISSION_COUNTER_KEY).await? {
                Some(meta) => {
                    let raw = self.backend.get(keys::SUBMISSION_COUNTER_KEY).await?;
                    let value: u64 = from_bytes(&raw)?;
                    Some((value, meta.version))
                }
                None => None,
            };

            let (next, precondition) = match &current {
                Some((value, version)) => (
                    value + 1,
                    WritePrecondition::MatchesVersion(version.clone()),
                ),
                None => (1, WritePrecondition::DoesNotExist),
            };

            let result = self
                .backend
                .put(keys::SUBMISSION_COUNTER_KEY, to_bytes(&next)?, precondition)
                .await?;

            match result {
                WriteResult::Success { .. } => return Ok(SubmissionId::from_u64(next)),
                WriteResult::PreconditionFailed { .. } => {
                    // Lost the race; re-read and try again.
                    continue;
                }
            }
        }
    }

    /// Persists a submission document.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the backend fails.
    pub async fn save_submission(&self, submission: &Submission) -> Result<()> {
        self.backend
            .put(
                &keys::submission(submission.id),
                to_bytes(submission)?,
                WritePrecondition::None,
            )
            .await?;
        Ok(())
    }

    /// Loads a submission document.
    ///
    /// # Errors
    ///
    /// Returns `Error::SubmissionNotFound` for unknown ids.
    pub async fn load_submission(&self, id: SubmissionId) -> Result<Submission> {
        match self.backend.get(&keys::submission(id)).await {
            Ok(bytes) => from_bytes(&bytes),
            Err(bespoke_core::Error::NotFound(_)) => Err(Error::SubmissionNotFound { id }),
            Err(e) => Err(e.into()),
        }
    }

    /// Persists one stage record of a submission.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the backend fails.
    pub async fn save_stage(
        &self,
        id: SubmissionId,
        ordinal: usize,
        stage: &StageRecord,
    ) -> Result<()> {
        self.backend
            .put(
                &keys::stage(id, ordinal),
                to_bytes(stage)?,
                WritePrecondition::None,
            )
            .await?;
        Ok(())
    }

    /// Loads all stage records of a submission, in ordinal order.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the backend fails.
    pub async fn load_stages(&self, id: SubmissionId) -> Result<Vec<StageRecord>> {
        let metas = self.backend.list(&keys::stage_prefix(id)).await?;
        let mut stages = Vec::with_capacity(metas.len());
        for meta in metas {
            let bytes = self.backend.get(&meta.key).await?;
            stages.push(from_bytes(&bytes)?);
        }
        Ok(stages)
    }

    /// Persists a task record.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the backend fails.
    pub async fn save_task(&self, task: &TaskRecord) -> Result<()> {
        self.backend
            .put(&keys::task(task.id), to_bytes(task)?, WritePrecondition::None)
            .await?;
        Ok(())
    }

    /// Loads a task record.
    ///
    /// # Errors
    ///
    /// Returns `Error::TaskNotFound` for unknown ids.
    pub async fn load_task(&self, id: TaskId) -> Result<TaskRecord> {
        match self.backend.get(&keys::task(id)).await {
            Ok(bytes) => from_bytes(&bytes),
            Err(bespoke_core::Error::NotFound(_)) => Err(Error::TaskNotFound { id }),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists submissions in id order with optional status filtering and
    /// cursor pagination. The returned cursor is the id to resume after.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the backend fails.
    pub async fn list_submissions(
        &self,
        status: Option<SubmissionStatus>,
        cursor: Option<u64>,
        limit: usize,
    ) -> Result<(Vec<Submission>, Option<u64>)> {
        let metas = self.backend.list(keys::SUBMISSION_PREFIX).await?;
        let mut page = Vec::new();
        let mut next = None;

        for meta in metas {
            if meta.key == keys::SUBMISSION_COUNTER_KEY {
                continue;
            }
            let bytes = self.backend.get(&meta.key).await?;
            let submission: Submission = from_bytes(&bytes)?;

            if let Some(after) = cursor {
                if submission.id.as_u64() <= after {
                    continue;
                }
            }
            if let Some(wanted) = status {
                if submission.status != wanted {
                    continue;
                }
            }
            if page.len() == limit {
                next = page.last().map(|s: &Submission| s.id.as_u64());
                break;
            }
            page.push(submission);
        }

        Ok((page, next))
    }

    /// Returns every submission whose aggregate status is non-terminal.
    ///
    /// Used at boot to resume interrupted work.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the backend fails.
    pub async fn non_terminal_submissions(&self) -> Result<Vec<Submission>> {
        let (all, _) = self.list_submissions(None, None, usize::MAX).await?;
        Ok(all
            .into_iter()
            .filter(|s| !s.status.is_terminal())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageKind;
    use crate::workflow::tests::minimal_workflow;
    use bespoke_core::MemoryBackend;

    fn store() -> StateStore {
        StateStore::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn ids_are_monotonic() {
        let store = store();
        let a = store.allocate_submission_id().await.unwrap();
        let b = store.allocate_submission_id().await.unwrap();
        assert_eq!(a.as_u64() + 1, b.as_u64());
    }

    #[tokio::test]
    async fn concurrent_allocation_never_duplicates() {
        let store = Arc::new(store());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.allocate_submission_id().await.unwrap()
            }));
        }

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            let id = handle.await.unwrap();
            assert!(seen.insert(id), "duplicate id allocated: {id}");
        }
    }

    #[tokio::test]
    async fn submission_roundtrip_is_field_for_field() {
        let store = store();
        let id = store.allocate_submission_id().await.unwrap();
        let submission = Submission::new(id, minimal_workflow());

        store.save_submission(&submission).await.unwrap();
        let loaded = store.load_submission(id).await.unwrap();

        assert_eq!(
            serde_json::to_value(&loaded).unwrap(),
            serde_json::to_value(&submission).unwrap()
        );
    }

    #[tokio::test]
    async fn missing_submission_is_not_found() {
        let store = store();
        let err = store
            .load_submission(SubmissionId::from_u64(404))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SubmissionNotFound { .. }));
    }

    #[tokio::test]
    async fn stages_load_in_ordinal_order() {
        let store = store();
        let id = SubmissionId::from_u64(1);
        let stages = Submission::materialize_stages();
        for (ordinal, stage) in stages.iter().enumerate() {
            store.save_stage(id, ordinal, stage).await.unwrap();
        }

        let loaded = store.load_stages(id).await.unwrap();
        let kinds: Vec<StageKind> = loaded.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StageKind::Fragmentation,
                StageKind::QcGeneration,
                StageKind::Optimization
            ]
        );
    }

    #[tokio::test]
    async fn list_filters_by_status_and_pages() {
        let store = store();
        for _ in 0..5 {
            let id = store.allocate_submission_id().await.unwrap();
            let mut submission = Submission::new(id, minimal_workflow());
            if id.as_u64() % 2 == 0 {
                submission
                    .apply_status(crate::submission::SubmissionStatus::Running)
                    .unwrap();
            }
            store.save_submission(&submission).await.unwrap();
        }

        let (running, _) = store
            .list_submissions(Some(SubmissionStatus::Running), None, 10)
            .await
            .unwrap();
        assert_eq!(running.len(), 2);

        let (first_page, next) = store.list_submissions(None, None, 2).await.unwrap();
        assert_eq!(first_page.len(), 2);
        let next = next.expect("more pages");

        let (second_page, _) = store.list_submissions(None, Some(next), 2).await.unwrap();
        assert_eq!(second_page.len(), 2);
        assert!(second_page[0].id > first_page[1].id);
    }

    #[tokio::test]
    async fn non_terminal_scan_skips_finished_submissions() {
        let store = store();
        let a = store.allocate_submission_id().await.unwrap();
        let mut done = Submission::new(a, minimal_workflow());
        done.apply_status(SubmissionStatus::Success).unwrap();
        store.save_submission(&done).await.unwrap();

        let b = store.allocate_submission_id().await.unwrap();
        let waiting = Submission::new(b, minimal_workflow());
        store.save_submission(&waiting).await.unwrap();

        let resumable = store.non_terminal_submissions().await.unwrap();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].id, b);
    }
}
