//! rollout - build, publish and converge a containerised web stack
//!
//! rollout deploys a four-service stack (database, API, frontend, edge
//! proxy) to a single host. It provides:
//!
//! - A deployment pipeline triggered by pushes to one branch
//! - Compose-compatible manifests applied on the host
//! - Optional safeguards: digest pinning, scoped teardown, gated
//!   verification with rollback, and a deployment lock
//! - A path-prefix edge proxy

pub mod config;
pub mod error;
pub mod host;
pub mod image;
pub mod manifest;
pub mod pipeline;
pub mod proxy;

pub use error::{Result, RolloutError};
