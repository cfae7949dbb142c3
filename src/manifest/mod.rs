//! Declarative service manifest
//!
//! This module provides the compose-compatible manifest the deployment
//! pipeline re-applies on the target host.

pub mod config;
pub mod parser;

pub use config::{Manifest, ServiceConfig, DEFAULT_NETWORK};
pub use parser::ManifestParser;
