//! In-memory registry and host
//!
//! Backs `rollout deploy --dry-run`: the full pipeline runs against a
//! registry that hands out fresh digests per build and a host that keeps
//! containers, networks and a lock in memory. Every operation yields to
//! the scheduler first, so two pipelines polled together interleave the
//! way two real runs against one host would.

use super::{
    Connector, HostSession, HostTarget, RunningContainer, TeardownScope, COMPOSE_PROJECT_LABEL,
    COMPOSE_SERVICE_LABEL,
};
use crate::error::{Result, RolloutError};
use crate::image::{BuildSpec, Digest, ImageRef};
use crate::manifest::{Manifest, ManifestParser};
use crate::pipeline::steps::{ImageBuilder, Registry, RegistryCredentials};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Project name used when the manifest has none
const DEFAULT_PROJECT: &str = "app";

#[derive(Default)]
struct RegistryState {
    tags: HashMap<String, Digest>,
    local: HashMap<String, Digest>,
    known: HashSet<Digest>,
    builds: Vec<String>,
    publishes: Vec<String>,
    authenticated: bool,
    next: u64,
    fail_auth: bool,
    fail_build: HashSet<String>,
    fail_publish: HashSet<String>,
}

impl RegistryState {
    fn fresh_digest(&mut self, image: &ImageRef) -> Digest {
        self.next += 1;
        let digest = Digest::of_bytes(format!("{}#{}", image, self.next).as_bytes());
        self.known.insert(digest.clone());
        digest
    }
}

fn tag_key(image: &ImageRef) -> String {
    format!("{}:{}", image.name(), image.effective_tag())
}

/// Registry and builder kept in memory
#[derive(Clone, Default)]
pub struct SimulatedRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl SimulatedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make an image available under its tag, as a third-party push would
    pub fn seed(&self, image: &ImageRef) -> Digest {
        let mut state = self.state();
        let digest = state.fresh_digest(image);
        state.tags.insert(tag_key(image), digest.clone());
        digest
    }

    /// Digest a reference currently resolves to
    pub fn resolve(&self, image: &ImageRef) -> Option<Digest> {
        let state = self.state();
        match &image.digest {
            Some(digest) => state.known.contains(digest).then(|| digest.clone()),
            None => state.tags.get(&tag_key(image)).cloned(),
        }
    }

    /// Reject the next logins
    pub fn fail_auth(&self) {
        self.state().fail_auth = true;
    }

    /// Fail builds of a service
    pub fn fail_build(&self, service: &str) {
        self.state().fail_build.insert(service.to_string());
    }

    /// Fail pushes to a repository
    pub fn fail_publish(&self, repository: &str) {
        self.state().fail_publish.insert(repository.to_string());
    }

    /// References built so far
    pub fn builds(&self) -> Vec<String> {
        self.state().builds.clone()
    }

    /// References pushed so far
    pub fn publishes(&self) -> Vec<String> {
        self.state().publishes.clone()
    }
}

impl ImageBuilder for SimulatedRegistry {
    async fn build(&self, spec: &BuildSpec) -> Result<()> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        if state.fail_build.contains(&spec.service) {
            return Err(RolloutError::Build {
                service: spec.service.clone(),
                message: "simulated build failure".to_string(),
            });
        }
        let digest = state.fresh_digest(&spec.image);
        state.local.insert(spec.image.to_string(), digest);
        state.builds.push(spec.image.to_string());
        Ok(())
    }
}

impl Registry for SimulatedRegistry {
    async fn authenticate(&self, credentials: &RegistryCredentials) -> Result<()> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        if state.fail_auth || !credentials.is_complete() {
            return Err(RolloutError::Authentication(format!(
                "registry rejected login for '{}'",
                credentials.username
            )));
        }
        state.authenticated = true;
        Ok(())
    }

    async fn publish(&self, image: &ImageRef) -> Result<Digest> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        let fail = |message: &str| RolloutError::Publish {
            image: image.to_string(),
            message: message.to_string(),
        };

        if !state.authenticated {
            return Err(fail("not logged in"));
        }
        if state.fail_publish.contains(&image.repository) {
            return Err(fail("simulated upload failure"));
        }
        let digest = state
            .local
            .get(&image.to_string())
            .cloned()
            .ok_or_else(|| fail("no local image with that reference"))?;

        state.tags.insert(tag_key(image), digest.clone());
        state.publishes.push(image.to_string());
        Ok(digest)
    }

    async fn alias(&self, source: &ImageRef, alias: &ImageRef) -> Result<()> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        let digest = match &source.digest {
            Some(d) => Some(d.clone()),
            None => state.tags.get(&tag_key(source)).cloned(),
        }
        .ok_or_else(|| RolloutError::Publish {
            image: source.to_string(),
            message: "unknown source image".to_string(),
        })?;

        state.tags.insert(tag_key(alias), digest);
        state.publishes.push(alias.to_string());
        Ok(())
    }
}

/// Host operations, in the order a session performed them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostOpKind {
    Connect,
    RemoveContainers,
    PruneImages,
    WriteManifest,
    PullImages,
    Up,
    ListRunning,
    ServiceReady,
    TryLock,
    Unlock,
    LockHolder,
}

impl std::fmt::Display for HostOpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HostOpKind::Connect => "connect",
            HostOpKind::RemoveContainers => "remove containers",
            HostOpKind::PruneImages => "prune images",
            HostOpKind::WriteManifest => "write manifest",
            HostOpKind::PullImages => "pull",
            HostOpKind::Up => "up",
            HostOpKind::ListRunning => "ps",
            HostOpKind::ServiceReady => "inspect",
            HostOpKind::TryLock => "lock",
            HostOpKind::Unlock => "unlock",
            HostOpKind::LockHolder => "lock holder",
        };
        f.write_str(name)
    }
}

/// Logged host operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOp {
    /// Session that performed the operation
    pub session: u64,
    pub kind: HostOpKind,
}

/// Container on the simulated host
#[derive(Debug, Clone, PartialEq)]
pub struct SimContainer {
    pub id: String,
    pub name: String,
    pub service: Option<String>,
    pub image: String,
    pub digest: Option<Digest>,
    pub labels: BTreeMap<String, String>,
    pub networks: Vec<String>,
    pub aliases: Vec<String>,
}

#[derive(Default)]
struct HostState {
    unreachable: bool,
    containers: BTreeMap<String, SimContainer>,
    manifest: Option<Manifest>,
    pulled: HashMap<String, Digest>,
    images: BTreeSet<Digest>,
    ops: Vec<HostOp>,
    fail_on: Option<HostOpKind>,
    unready: HashSet<String>,
    lock: Option<String>,
    next_container: u64,
    next_session: u64,
}

impl HostState {
    fn next_id(&mut self) -> String {
        self.next_container += 1;
        format!("{:012x}", self.next_container)
    }
}

/// Host kept in memory
#[derive(Clone)]
pub struct SimulatedHost {
    state: Arc<Mutex<HostState>>,
    registry: SimulatedRegistry,
}

impl SimulatedHost {
    /// Create a host that pulls from `registry`
    pub fn new(registry: SimulatedRegistry) -> Self {
        Self {
            state: Arc::new(Mutex::new(HostState::default())),
            registry,
        }
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse connections
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Fail every future operation of this kind
    pub fn fail_on(&self, kind: HostOpKind) {
        self.state().fail_on = Some(kind);
    }

    /// Keep a service from ever reporting ready
    pub fn set_unready(&self, service: &str) {
        self.state().unready.insert(service.to_string());
    }

    /// Allow a service to report ready again
    pub fn set_ready(&self, service: &str) {
        self.state().unready.remove(service);
    }

    /// Start a container that belongs to some other workload
    pub fn add_foreign_container(&self, name: &str, image: &str) -> String {
        let mut state = self.state();
        let id = state.next_id();
        state.containers.insert(
            id.clone(),
            SimContainer {
                id: id.clone(),
                name: name.to_string(),
                service: None,
                image: image.to_string(),
                digest: None,
                labels: BTreeMap::new(),
                networks: vec!["bridge".to_string()],
                aliases: Vec::new(),
            },
        );
        id
    }

    /// Containers currently on the host
    pub fn containers(&self) -> Vec<SimContainer> {
        self.state().containers.values().cloned().collect()
    }

    /// Operation log
    pub fn ops(&self) -> Vec<HostOp> {
        self.state().ops.clone()
    }

    /// Current lock holder
    pub fn lock_holder(&self) -> Option<String> {
        self.state().lock.clone()
    }

    /// Manifest last written to the host
    pub fn manifest(&self) -> Option<Manifest> {
        self.state().manifest.clone()
    }

    /// Container a name resolves to from inside `network`
    pub fn resolve_name(&self, network: &str, name: &str) -> Option<SimContainer> {
        self.state()
            .containers
            .values()
            .filter(|c| c.networks.iter().any(|n| n == network))
            .find(|c| {
                c.service.as_deref() == Some(name)
                    || c.name == name
                    || c.aliases.iter().any(|a| a == name)
            })
            .cloned()
    }
}

impl Connector for SimulatedHost {
    type Session = SimulatedSession;

    async fn connect(&self, target: &HostTarget) -> Result<SimulatedSession> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        state.next_session += 1;
        let id = state.next_session;
        state.ops.push(HostOp {
            session: id,
            kind: HostOpKind::Connect,
        });

        if state.unreachable {
            return Err(RolloutError::Connection(format!(
                "{}:{} refused the connection",
                target.address, target.port
            )));
        }

        debug!("simulated session {} opened to {}", id, target.destination());
        Ok(SimulatedSession {
            id,
            host: self.clone(),
        })
    }
}

/// Session on a [`SimulatedHost`]
pub struct SimulatedSession {
    id: u64,
    host: SimulatedHost,
}

impl SimulatedSession {
    /// Log the operation and apply fault injection
    async fn begin(&self, kind: HostOpKind) -> Result<MutexGuard<'_, HostState>> {
        tokio::task::yield_now().await;
        let mut state = self.host.state();
        state.ops.push(HostOp {
            session: self.id,
            kind,
        });
        if state.fail_on == Some(kind) {
            return Err(RolloutError::RemoteCommand {
                command: kind.to_string(),
                code: 1,
                stderr: "simulated failure".to_string(),
            });
        }
        Ok(state)
    }

    fn pull_error(image: &str) -> RolloutError {
        RolloutError::RemoteCommand {
            command: HostOpKind::PullImages.to_string(),
            code: 1,
            stderr: format!("pull access denied for {}", image),
        }
    }

    fn missing_manifest() -> RolloutError {
        RolloutError::RemoteCommand {
            command: HostOpKind::Up.to_string(),
            code: 1,
            stderr: "no configuration file provided: not found".to_string(),
        }
    }
}

impl HostSession for SimulatedSession {
    async fn remove_containers(&self, scope: &TeardownScope) -> Result<usize> {
        let mut state = self.begin(HostOpKind::RemoveContainers).await?;
        let before = state.containers.len();
        state.containers.retain(|_, c| !scope.covers(&c.labels));
        Ok(before - state.containers.len())
    }

    async fn prune_images(&self, _scope: &TeardownScope) -> Result<()> {
        let mut state = self.begin(HostOpKind::PruneImages).await?;
        let in_use: BTreeSet<Digest> = state
            .containers
            .values()
            .filter_map(|c| c.digest.clone())
            .collect();
        state.images.retain(|d| in_use.contains(d));
        state.pulled.clear();
        Ok(())
    }

    async fn write_manifest(&self, yaml: &str) -> Result<()> {
        let manifest = ManifestParser::parse_str(yaml)?;
        let mut state = self.begin(HostOpKind::WriteManifest).await?;
        state.manifest = Some(manifest);
        Ok(())
    }

    async fn pull_images(&self) -> Result<()> {
        let mut state = self.begin(HostOpKind::PullImages).await?;
        let manifest = state.manifest.clone().ok_or_else(Self::missing_manifest)?;

        for (service, config) in &manifest.services {
            let image = config.image.as_deref().unwrap_or_default();
            let reference = ImageRef::parse(image).map_err(|_| Self::pull_error(image))?;
            let digest = self
                .host
                .registry
                .resolve(&reference)
                .ok_or_else(|| Self::pull_error(image))?;
            state.images.insert(digest.clone());
            state.pulled.insert(service.clone(), digest);
        }
        Ok(())
    }

    async fn up(&self) -> Result<()> {
        let mut state = self.begin(HostOpKind::Up).await?;
        let manifest = state.manifest.clone().ok_or_else(Self::missing_manifest)?;
        let project = manifest
            .name
            .clone()
            .unwrap_or_else(|| DEFAULT_PROJECT.to_string());

        for service in manifest.start_order()? {
            let config = &manifest.services[&service];
            let image = config.image.clone().unwrap_or_default();

            let digest = match state.pulled.get(&service) {
                Some(d) => d.clone(),
                None => {
                    let reference =
                        ImageRef::parse(&image).map_err(|_| Self::pull_error(&image))?;
                    self.host
                        .registry
                        .resolve(&reference)
                        .ok_or_else(|| Self::pull_error(&image))?
                }
            };
            state.images.insert(digest.clone());

            let name = config
                .container_name
                .clone()
                .unwrap_or_else(|| format!("{}-{}-1", project, service));
            state.containers.retain(|_, c| c.name != name);

            let mut labels = config.label_map();
            labels.insert(COMPOSE_PROJECT_LABEL.to_string(), project.clone());
            labels.insert(COMPOSE_SERVICE_LABEL.to_string(), service.clone());

            let networks = config.network_names();
            let aliases: Vec<String> = config
                .networks
                .as_ref()
                .map(|n| networks.iter().flat_map(|net| n.aliases(net)).collect())
                .unwrap_or_default();

            let id = state.next_id();
            state.containers.insert(
                id.clone(),
                SimContainer {
                    id,
                    name,
                    service: Some(service.clone()),
                    image,
                    digest: Some(digest),
                    labels,
                    networks,
                    aliases,
                },
            );
        }
        Ok(())
    }

    async fn list_running(&self) -> Result<Vec<RunningContainer>> {
        let state = self.begin(HostOpKind::ListRunning).await?;
        Ok(state
            .containers
            .values()
            .map(|c| RunningContainer {
                id: c.id.clone(),
                name: c.name.clone(),
                image: c.image.clone(),
                service: c.service.clone(),
                networks: c.networks.clone(),
                labels: c.labels.clone(),
            })
            .collect())
    }

    async fn service_ready(&self, service: &str) -> Result<bool> {
        let state = self.begin(HostOpKind::ServiceReady).await?;
        let running = state
            .containers
            .values()
            .any(|c| c.service.as_deref() == Some(service));
        Ok(running && !state.unready.contains(service))
    }

    async fn try_lock(&self, holder: &str) -> Result<bool> {
        let mut state = self.begin(HostOpKind::TryLock).await?;
        if state.lock.is_some() {
            return Ok(false);
        }
        state.lock = Some(holder.to_string());
        Ok(true)
    }

    async fn unlock(&self, holder: &str) -> Result<()> {
        let mut state = self.begin(HostOpKind::Unlock).await?;
        if state.lock.as_deref() == Some(holder) {
            state.lock = None;
        }
        Ok(())
    }

    async fn lock_holder(&self) -> Result<Option<String>> {
        let state = self.begin(HostOpKind::LockHolder).await?;
        Ok(state.lock.clone())
    }
}
