//! Image references and build specifications
//!
//! This module describes the deployment artifacts: what gets built, the
//! tag it is published under, and the digest it resolves to.

pub mod build;
pub mod docker;
pub mod reference;

pub use build::{content_tag, BuildSpec};
pub use docker::DockerCli;
pub use reference::{Digest, ImageRef, DEFAULT_TAG};
