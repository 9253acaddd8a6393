//! # bespoke-api
//!
//! HTTP surface of the bespoke executor coordinator.
//!
//! ## Routes
//!
//! - `POST   /submissions` - Submit workflows
//! - `GET    /submissions/{id}` - Full submission state
//! - `GET    /submissions` - Paged listing (`?status=&cursor=&limit=`)
//! - `DELETE /submissions/{id}` - Cooperative cancellation
//! - `GET    /health` - Liveness
//! - `GET    /openapi.json` - Generated API document
//!
//! The coordinator trusts its network peers: there is no authentication
//! layer, only input validation at every ingress.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod openapi;
pub mod routes;
pub mod server;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use server::Server;
