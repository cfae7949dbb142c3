//! Target host access
//!
//! The pipeline talks to the deployment host through [`Connector`] and
//! [`HostSession`]. Two implementations exist: [`ssh`] drives the docker
//! CLI on a real machine over the system ssh client, and [`simulated`]
//! keeps an in-memory host for dry runs.

pub mod command;
pub mod simulated;
pub mod ssh;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub use command::{CommandError, CommandOutput, CommandRunner};
pub use simulated::{SimulatedHost, SimulatedRegistry};
pub use ssh::{SshConnector, SshSession};

/// Label compose puts on every container it creates
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";
/// Label compose uses for the project name
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
/// Label stamped on the stack's services for scoped teardown
pub const STACK_LABEL: &str = "com.rollout.project";

/// Where and how to reach the deployment host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostTarget {
    /// Host name or address
    pub address: String,
    /// Login user
    pub user: String,
    /// SSH port
    pub port: u16,
    /// Private key file
    pub identity_file: Option<PathBuf>,
    /// Directory holding the manifest on the host, relative to the login home
    pub workdir: String,
}

impl HostTarget {
    /// `user@address` destination
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }
}

/// Which containers teardown removes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TeardownScope {
    /// Every container on the host, including unrelated workloads
    HostWide,
    /// Only containers carrying `key=value`
    Labeled { key: String, value: String },
}

impl TeardownScope {
    /// Scope limited to one stack
    pub fn for_stack(project: &str) -> Self {
        TeardownScope::Labeled {
            key: STACK_LABEL.to_string(),
            value: project.to_string(),
        }
    }

    /// Whether a container with these labels falls inside the scope
    pub fn covers(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            TeardownScope::HostWide => true,
            TeardownScope::Labeled { key, value } => labels.get(key) == Some(value),
        }
    }
}

impl std::fmt::Display for TeardownScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TeardownScope::HostWide => write!(f, "host-wide"),
            TeardownScope::Labeled { key, value } => write!(f, "label {}={}", key, value),
        }
    }
}

/// A container observed running on the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningContainer {
    /// Container ID
    pub id: String,
    /// Container name
    pub name: String,
    /// Image the container runs
    pub image: String,
    /// Compose service, if the container belongs to one
    pub service: Option<String>,
    /// Networks the container is attached to
    pub networks: Vec<String>,
    /// Container labels
    pub labels: BTreeMap<String, String>,
}

/// Identity written into the host lock: `hostname:pid:run_id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub hostname: String,
    pub pid: u32,
    pub run_id: String,
}

impl LockHolder {
    /// Holder for a run of this process
    pub fn current(run_id: &str) -> Self {
        Self {
            hostname: local_hostname(),
            pid: std::process::id(),
            run_id: run_id.to_string(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().splitn(3, ':');
        let hostname = parts.next().filter(|h| !h.is_empty())?;
        let pid = parts.next()?.parse().ok()?;
        let run_id = parts.next()?;
        Some(Self {
            hostname: hostname.to_string(),
            pid,
            run_id: run_id.to_string(),
        })
    }

    /// A holder is stale when it ran on this machine and its process is gone
    pub fn is_stale(&self, local_host: &str, alive: impl Fn(u32) -> bool) -> bool {
        self.hostname == local_host && !alive(self.pid)
    }
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.hostname, self.pid, self.run_id)
    }
}

pub fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// Whether a local process exists; assumed alive where `/proc` is absent
pub fn process_alive(pid: u32) -> bool {
    let proc = Path::new("/proc");
    !proc.is_dir() || proc.join(pid.to_string()).exists()
}

/// Opens sessions to a host
#[allow(async_fn_in_trait)]
pub trait Connector {
    type Session: HostSession;

    /// Establish a remote execution channel
    async fn connect(&self, target: &HostTarget) -> Result<Self::Session>;
}

/// Operations the pipeline performs on a connected host
#[allow(async_fn_in_trait)]
pub trait HostSession {
    /// Remove containers in scope, returning how many were removed
    async fn remove_containers(&self, scope: &TeardownScope) -> Result<usize>;

    /// Prune unused images
    async fn prune_images(&self, scope: &TeardownScope) -> Result<()>;

    /// Replace the manifest on the host
    async fn write_manifest(&self, yaml: &str) -> Result<()>;

    /// Pull every image the manifest references
    async fn pull_images(&self) -> Result<()>;

    /// Start the declared services
    async fn up(&self) -> Result<()>;

    /// List running containers
    async fn list_running(&self) -> Result<Vec<RunningContainer>>;

    /// Whether a service's container is running and healthy
    async fn service_ready(&self, service: &str) -> Result<bool>;

    /// Try to take the deployment lock
    async fn try_lock(&self, holder: &str) -> Result<bool>;

    /// Release the deployment lock if `holder` owns it
    async fn unlock(&self, holder: &str) -> Result<()>;

    /// Who holds the deployment lock, if anyone
    async fn lock_holder(&self) -> Result<Option<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_covers() {
        let mut labels = BTreeMap::new();
        labels.insert(STACK_LABEL.to_string(), "shop".to_string());

        assert!(TeardownScope::HostWide.covers(&BTreeMap::new()));
        assert!(TeardownScope::for_stack("shop").covers(&labels));
        assert!(!TeardownScope::for_stack("blog").covers(&labels));
        assert!(!TeardownScope::for_stack("shop").covers(&BTreeMap::new()));
    }

    #[test]
    fn test_destination() {
        let target = HostTarget {
            address: "203.0.113.7".to_string(),
            user: "deploy".to_string(),
            port: 22,
            identity_file: None,
            workdir: "app".to_string(),
        };
        assert_eq!(target.destination(), "deploy@203.0.113.7");
        assert_eq!(TeardownScope::HostWide.to_string(), "host-wide");
    }

    #[test]
    fn test_lock_holder() {
        let holder = LockHolder::parse("ci-runner-3:4242:8d0f6a1e-5c1b").unwrap();
        assert_eq!(holder.hostname, "ci-runner-3");
        assert_eq!(holder.pid, 4242);
        assert_eq!(holder.to_string(), "ci-runner-3:4242:8d0f6a1e-5c1b");

        assert!(holder.is_stale("ci-runner-3", |_| false));
        assert!(!holder.is_stale("ci-runner-3", |pid| pid == 4242));
        // another machine's process cannot be checked from here
        assert!(!holder.is_stale("laptop", |_| false));

        assert!(LockHolder::parse("someone-else").is_none());
        assert!(LockHolder::parse("host:notapid:run").is_none());
        assert!(LockHolder::parse(":1:run").is_none());

        let current = LockHolder::current("run");
        assert!(!current.is_stale(&local_hostname(), process_alive));
    }
}
