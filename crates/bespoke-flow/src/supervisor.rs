//! Process lifecycle: bring-up order and draining shutdown.
//!
//! The supervisor owns the whole deployment. `start` brings components up
//! in dependency order (result store, task queue, coordinator, workers)
//! and hands back the coordinator for the HTTP surface to wrap.
//! `shutdown` stops submission intake, signals workers to drain, waits up
//! to the grace period for in-flight tasks, then aborts what remains. A
//! second `shutdown` is a no-op.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use bespoke_core::{FsBackend, StoreBackend};

use crate::cache::CacheManager;
use crate::config::ExecutorConfig;
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::executor::{CancellationRegistry, ExecutionBudget, ExecutorSet};
use crate::queue;
use crate::store::StateStore;
use crate::task::RoutingKey;
use crate::worker::{Worker, WorkerConfig};

struct Running {
    coordinator: Arc<Coordinator>,
    shutdown_tx: watch::Sender<bool>,
    worker_handles: Vec<JoinHandle<()>>,
    event_loop: JoinHandle<()>,
}

/// Owns and supervises one executor deployment.
pub struct Supervisor {
    config: ExecutorConfig,
    executors: ExecutorSet,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Creates a supervisor with the given configuration and executors.
    #[must_use]
    pub fn new(config: ExecutorConfig, executors: ExecutorSet) -> Self {
        Self {
            config,
            executors,
            running: Mutex::new(None),
        }
    }

    /// Returns the configuration this supervisor runs with.
    #[must_use]
    pub const fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Brings the deployment up and returns the coordinator.
    ///
    /// Calling `start` while already running returns the live
    /// coordinator without spawning anything new.
    ///
    /// # Errors
    ///
    /// Returns an error if the store directory cannot be opened or the
    /// queue backend is unavailable.
    pub async fn start(&self) -> Result<Arc<Coordinator>> {
        let mut running = self.running.lock().await;
        if let Some(running) = running.as_ref() {
            return Ok(Arc::clone(&running.coordinator));
        }

        let backend: Arc<dyn StoreBackend> = Arc::new(FsBackend::open(&self.config.directory)?);
        self.start_with_backend_locked(&mut running, backend).await
    }

    /// Brings the deployment up over an explicit backend.
    ///
    /// This is what tests use to run a full deployment against the
    /// in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue backend is unavailable.
    pub async fn start_with_backend(
        &self,
        backend: Arc<dyn StoreBackend>,
    ) -> Result<Arc<Coordinator>> {
        let mut running = self.running.lock().await;
        if let Some(running) = running.as_ref() {
            return Ok(Arc::clone(&running.coordinator));
        }
        self.start_with_backend_locked(&mut running, backend).await
    }

    async fn start_with_backend_locked(
        &self,
        running: &mut Option<Running>,
        backend: Arc<dyn StoreBackend>,
    ) -> Result<Arc<Coordinator>> {
        let store = StateStore::new(Arc::clone(&backend));
        let cache = Arc::new(CacheManager::new(
            Arc::clone(&backend),
            self.config.lease_ttl,
        ));
        let task_queue = queue::connect(
            &self.config.queue_url,
            backend,
            self.config.retry_limits.clone(),
        )
        .await?;
        let cancellations = Arc::new(CancellationRegistry::new());

        let (coordinator, streams) = Coordinator::new(
            store.clone(),
            Arc::clone(&cache),
            Arc::clone(&task_queue),
            Arc::clone(&cancellations),
        );

        let resumed = coordinator.resume().await?;
        if resumed > 0 {
            tracing::info!(resumed, "resumed non-terminal submissions");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let event_loop = tokio::spawn(
            Arc::clone(&coordinator).run_event_loop(streams, shutdown_rx.clone()),
        );

        let mut worker_handles = Vec::new();
        let pools = [
            (
                RoutingKey::Fragment,
                self.config.n_fragmenter_workers,
                ExecutionBudget::default(),
            ),
            (
                RoutingKey::Qc,
                self.config.n_qc_compute_workers,
                ExecutionBudget {
                    n_cores: self.config.qc_compute_n_cores.resolve(),
                    max_memory_gib_per_core: self.config.qc_compute_max_mem,
                },
            ),
            (
                RoutingKey::Optimize,
                self.config.n_optimizer_workers,
                ExecutionBudget::default(),
            ),
        ];

        for (routing_key, count, budget) in pools {
            for _ in 0..count {
                let worker = Worker::new(
                    WorkerConfig::for_routing_key(routing_key).with_budget(budget.clone()),
                    Arc::clone(&task_queue),
                    Arc::clone(&cache),
                    store.clone(),
                    self.executors.clone(),
                    Arc::clone(&cancellations),
                    coordinator.completion_sender(),
                    shutdown_rx.clone(),
                );
                worker_handles.push(tokio::spawn(worker.run()));
            }
        }

        tracing::info!(
            n_fragmenter = self.config.n_fragmenter_workers,
            n_qc = self.config.n_qc_compute_workers,
            n_optimizer = self.config.n_optimizer_workers,
            "executor started"
        );

        *running = Some(Running {
            coordinator: Arc::clone(&coordinator),
            shutdown_tx,
            worker_handles,
            event_loop,
        });
        Ok(coordinator)
    }

    /// Drains and stops the deployment. Idempotent.
    pub async fn shutdown(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        running.coordinator.stop_accepting();
        let _ = running.shutdown_tx.send(true);

        let grace = self.config.shutdown_grace;
        let deadline = tokio::time::Instant::now() + grace;
        for mut handle in running.worker_handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                tracing::warn!("worker did not drain within the grace period; aborting");
                handle.abort();
            }
        }

        // The event loop exits on the shutdown signal; give it a moment,
        // then abort regardless.
        let mut event_loop = running.event_loop;
        if tokio::time::timeout(std::time::Duration::from_secs(1), &mut event_loop)
            .await
            .is_err()
        {
            tracing::warn!("event loop did not stop; aborted");
            event_loop.abort();
        }

        tracing::info!("executor stopped");
    }
}
