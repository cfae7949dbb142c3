//! rollout configuration
//!
//! Settings live in `rollout.yaml` next to the manifest. Secrets never do:
//! registry credentials, the host address and the SSH key path come from
//! the environment.

use crate::error::{Result, RolloutError};
use crate::host::HostTarget;
use crate::image::{BuildSpec, ImageRef};
use crate::manifest::config::BuildConfig;
use crate::manifest::{Manifest, ManifestParser};
use crate::pipeline::{DeployPolicy, DeploymentPlan, RegistryCredentials};
use crate::proxy::{RouteTable, DEFAULT_LISTEN, DEFAULT_READ_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "rollout.yaml";

pub const ENV_REGISTRY: &str = "ROLLOUT_REGISTRY";
pub const ENV_REGISTRY_USERNAME: &str = "ROLLOUT_REGISTRY_USERNAME";
pub const ENV_REGISTRY_TOKEN: &str = "ROLLOUT_REGISTRY_TOKEN";
pub const ENV_HOST: &str = "ROLLOUT_HOST";
pub const ENV_SSH_KEY: &str = "ROLLOUT_SSH_KEY";

/// Host address used by dry runs
const SIMULATED_HOST: &str = "simulated";
/// Registry login used by dry runs without credentials
const SIMULATED_LOGIN: &str = "dry-run";

/// Overrides for one built image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Build context, relative to the config file
    pub context: Option<PathBuf>,
    /// Build file, relative to the context
    pub dockerfile: Option<PathBuf>,
    /// Repository and tag to publish as
    pub repository: Option<String>,
}

/// Deployment host settings; the address comes from `ROLLOUT_HOST`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub user: String,
    pub port: u16,
    /// Directory on the host holding the manifest
    pub workdir: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            user: "deploy".to_string(),
            port: 22,
            workdir: "app".to_string(),
        }
    }
}

/// Pipeline execution settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound on each local or remote command; unset waits forever
    pub command_timeout_secs: Option<u64>,
    /// State directory (history, delivery ledger, run reports)
    pub data_dir: Option<PathBuf>,
}

/// Edge proxy settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen: String,
    pub routes: RouteTable,
    /// Time a client gets to send its request head and body
    pub read_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            routes: RouteTable::default(),
            read_timeout_secs: DEFAULT_READ_TIMEOUT.as_secs(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    /// Project name; falls back to the manifest's `name`
    pub project: Option<String>,
    /// Branch whose pushes deploy
    pub branch: String,
    /// Manifest path; found automatically when unset
    pub manifest: Option<PathBuf>,
    /// Per-service image overrides
    pub images: BTreeMap<String, ImageConfig>,
    pub host: HostConfig,
    pub policy: DeployPolicy,
    pub pipeline: PipelineConfig,
    pub proxy: ProxyConfig,
    /// Directory relative paths resolve against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            project: None,
            branch: "main".to_string(),
            manifest: None,
            images: BTreeMap::new(),
            host: HostConfig::default(),
            policy: DeployPolicy::default(),
            pipeline: PipelineConfig::default(),
            proxy: ProxyConfig::default(),
            base_dir: PathBuf::from("."),
        }
    }
}

impl RolloutConfig {
    /// Load an explicit config file, or `rollout.yaml` in `dir` if present
    pub fn discover(explicit: Option<&Path>, dir: &Path) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let path = dir.join(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::load(&path)
                } else {
                    Ok(Self {
                        base_dir: dir.to_path_buf(),
                        ..Self::default()
                    })
                }
            }
        }
    }

    /// Load a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RolloutError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::parse(&content)?;
        config.base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(config)
    }

    /// Parse config YAML
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| RolloutError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.branch.is_empty() {
            return Err(RolloutError::InvalidConfig("branch must not be empty".to_string()));
        }
        if self.host.port == 0 {
            return Err(RolloutError::InvalidConfig("host port must not be 0".to_string()));
        }
        self.proxy.routes.validate()
    }

    /// State directory, `<data dir>/rollout` unless configured
    pub fn data_dir(&self) -> PathBuf {
        self.pipeline.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("/var/lib"))
                .join("rollout")
        })
    }

    pub fn history_path(&self) -> PathBuf {
        self.data_dir().join("releases.json")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir().join("deliveries.json")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.data_dir().join("runs")
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.pipeline.command_timeout_secs.map(Duration::from_secs)
    }

    /// Manifest path: configured, or the first default name found
    pub fn manifest_path(&self) -> Result<PathBuf> {
        match &self.manifest {
            Some(path) => Ok(self.base_dir.join(path)),
            None => ManifestParser::find_manifest_file(&self.base_dir).ok_or_else(|| {
                RolloutError::InvalidConfig(format!(
                    "no manifest found in {}",
                    self.base_dir.display()
                ))
            }),
        }
    }

    /// Parse, interpolate and validate the manifest
    pub fn load_manifest(&self, env: &HashMap<String, String>) -> Result<Manifest> {
        let mut manifest = ManifestParser::parse_file(&self.manifest_path()?)?;
        ManifestParser::interpolate(&mut manifest, env)?;
        for warning in ManifestParser::validate(&manifest)? {
            warn!("{}", warning);
        }
        Ok(manifest)
    }

    /// Project name
    pub fn project_name(&self, manifest: &Manifest) -> String {
        self.project
            .clone()
            .or_else(|| manifest.name.clone())
            .unwrap_or_else(|| "app".to_string())
    }

    /// Images the pipeline builds: every service with a `build` section
    /// or an `images` entry
    pub fn build_specs(&self, manifest: &Manifest) -> Result<Vec<BuildSpec>> {
        let mut specs = Vec::new();

        for (service, config) in &manifest.services {
            let overrides = self.images.get(service);
            if config.build.is_none() && overrides.is_none() {
                continue;
            }
            let overrides = overrides.cloned().unwrap_or_default();

            let (context, dockerfile) = match &config.build {
                Some(BuildConfig::Simple(context)) => (Some(PathBuf::from(context)), None),
                Some(BuildConfig::Full(full)) => (
                    full.context.as_ref().map(PathBuf::from),
                    full.dockerfile.as_ref().map(PathBuf::from),
                ),
                None => (None, None),
            };
            let context = overrides.context.or(context).ok_or_else(|| {
                RolloutError::InvalidConfig(format!("service '{}' has no build context", service))
            })?;
            let repository = overrides
                .repository
                .or_else(|| config.image.clone())
                .ok_or_else(|| {
                    RolloutError::InvalidConfig(format!(
                        "service '{}' is built but has no image to publish",
                        service
                    ))
                })?;

            let mut spec = BuildSpec::new(
                service,
                self.base_dir.join(context),
                ImageRef::parse(&repository)?,
            );
            if let Some(dockerfile) = overrides.dockerfile.or(dockerfile) {
                spec = spec.dockerfile(dockerfile);
            }
            specs.push(spec);
        }

        for service in self.images.keys() {
            if !manifest.services.contains_key(service) {
                return Err(RolloutError::InvalidConfig(format!(
                    "image configured for unknown service '{}'",
                    service
                )));
            }
        }
        Ok(specs)
    }

    /// Registry login from the environment
    pub fn credentials(&self, env: &HashMap<String, String>) -> RegistryCredentials {
        RegistryCredentials {
            registry: env.get(ENV_REGISTRY).filter(|r| !r.is_empty()).cloned(),
            username: env.get(ENV_REGISTRY_USERNAME).cloned().unwrap_or_default(),
            token: env.get(ENV_REGISTRY_TOKEN).cloned().unwrap_or_default(),
        }
    }

    /// Deployment host; the address is required unless `simulated`
    pub fn target(&self, env: &HashMap<String, String>, simulated: bool) -> Result<HostTarget> {
        let address = match env.get(ENV_HOST).filter(|h| !h.is_empty()) {
            Some(address) => address.clone(),
            None if simulated => SIMULATED_HOST.to_string(),
            None => {
                return Err(RolloutError::InvalidConfig(format!(
                    "{} is not set",
                    ENV_HOST
                )))
            }
        };
        Ok(HostTarget {
            address,
            user: self.host.user.clone(),
            port: self.host.port,
            identity_file: env.get(ENV_SSH_KEY).filter(|k| !k.is_empty()).map(PathBuf::from),
            workdir: self.host.workdir.clone(),
        })
    }

    /// Everything a run needs
    pub fn plan(
        &self,
        env: &HashMap<String, String>,
        policy: DeployPolicy,
        simulated: bool,
    ) -> Result<DeploymentPlan> {
        let manifest = self.load_manifest(env)?;
        let mut credentials = self.credentials(env);
        if !credentials.is_complete() {
            if !simulated {
                return Err(RolloutError::InvalidConfig(format!(
                    "{} and {} must be set",
                    ENV_REGISTRY_USERNAME, ENV_REGISTRY_TOKEN
                )));
            }
            credentials.username = SIMULATED_LOGIN.to_string();
            credentials.token = SIMULATED_LOGIN.to_string();
        }

        Ok(DeploymentPlan {
            project: self.project_name(&manifest),
            builds: self.build_specs(&manifest)?,
            credentials,
            target: self.target(env, simulated)?,
            policy,
            manifest,
        })
    }
}
