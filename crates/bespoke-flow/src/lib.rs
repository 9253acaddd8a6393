//! # bespoke-flow
//!
//! The bespoke executor engine: a coordinator that turns workflow
//! submissions into an ordered sequence of stages (fragmentation →
//! qc-generation → optimization), dispatches per-stage tasks to worker
//! pools, deduplicates computation through a fingerprint-keyed cache with
//! leases, and persists every transition so submissions survive restarts.
//!
//! ## Core Concepts
//!
//! - **Submission**: one workflow document and its lifecycle state
//! - **Stage**: one ordered step; stage *k+1* starts only after *k* is
//!   terminal
//! - **Task**: the smallest dispatched unit; many per stage
//! - **Fingerprint**: stable content hash over a task's input and method
//!   spec, used as the cache key
//! - **Lease**: a time-bounded exclusive claim on a fingerprint
//!
//! ## Guarantees
//!
//! - At most one task per fingerprint is in flight system-wide
//! - Terminal submission and stage states are sticky
//! - A persisted submission resumes after a coordinator crash
//!
//! ## Example
//!
//! ```rust,no_run
//! use bespoke_flow::config::ExecutorConfig;
//! use bespoke_flow::executor::ExecutorSet;
//! use bespoke_flow::supervisor::Supervisor;
//!
//! # async fn demo() -> bespoke_flow::error::Result<()> {
//! let supervisor = Supervisor::new(ExecutorConfig::default(), ExecutorSet::stubs());
//! let coordinator = supervisor.start().await?;
//! // ... serve HTTP over the coordinator, submit workflows ...
//! supervisor.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod documents;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod orchestrator;
pub mod queue;
pub mod stage;
pub mod store;
pub mod submission;
pub mod supervisor;
pub mod task;
pub mod worker;
pub mod workflow;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cache::{AcquireOutcome, CacheEntry, CacheManager};
    pub use crate::config::ExecutorConfig;
    pub use crate::coordinator::{CancelOutcome, Coordinator, SubmissionDetail};
    pub use crate::documents::{StageInput, StageOutput};
    pub use crate::error::{Error, Result};
    pub use crate::executor::{ExecutorSet, StageExecutor};
    pub use crate::fingerprint::Fingerprint;
    pub use crate::queue::{QueueItem, TaskQueue};
    pub use crate::stage::{StageKind, StageRecord, StageState};
    pub use crate::store::StateStore;
    pub use crate::submission::{Submission, SubmissionStatus};
    pub use crate::supervisor::Supervisor;
    pub use crate::task::{RoutingKey, TaskRecord, TaskState};
    pub use crate::worker::{Worker, WorkerConfig};
    pub use crate::workflow::BespokeWorkflow;
}
