//! # bespoke-core
//!
//! Shared kernel for the bespoke executor services.
//!
//! This crate provides the pieces every other crate leans on:
//!
//! - **Typed identifiers**: submission, task, and worker ids
//! - **Storage contract**: preconditioned key/value writes with memory and
//!   filesystem backends
//! - **Canonical JSON**: deterministic serialization for fingerprint hashing
//! - **Observability**: logging initialization and span helpers
//!
//! Nothing in this crate knows about workflows, stages, or HTTP; it is the
//! substrate the executor is built on.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod canonical;
pub mod error;
pub mod id;
pub mod keys;
pub mod observability;
pub mod storage;

pub use error::{Error, Result};
pub use id::{SubmissionId, TaskId, WorkerId};
pub use storage::{
    FsBackend, MemoryBackend, ObjectMeta, StoreBackend, WritePrecondition, WriteResult,
};
