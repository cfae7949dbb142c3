//! Local pipeline collaborators: image builds and the registry

use crate::error::Result;
use crate::image::{BuildSpec, Digest, ImageRef};
use std::fmt;

/// Registry login
#[derive(Clone, Default)]
pub struct RegistryCredentials {
    /// Registry host; `None` means the default registry
    pub registry: Option<String>,
    pub username: String,
    pub token: String,
}

impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("registry", &self.registry)
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl RegistryCredentials {
    pub fn is_complete(&self) -> bool {
        !self.username.is_empty() && !self.token.is_empty()
    }
}

/// Builds images from a context directory
#[allow(async_fn_in_trait)]
pub trait ImageBuilder {
    /// Build and tag `spec.image` locally
    async fn build(&self, spec: &BuildSpec) -> Result<()>;
}

/// Image registry the host pulls from
#[allow(async_fn_in_trait)]
pub trait Registry {
    /// Log in; nothing is built or pushed before this succeeds
    async fn authenticate(&self, credentials: &RegistryCredentials) -> Result<()>;

    /// Push a locally built image, returning its digest
    async fn publish(&self, image: &ImageRef) -> Result<Digest>;

    /// Point `alias` at the content of `source`
    async fn alias(&self, source: &ImageRef, alias: &ImageRef) -> Result<()>;
}
