//! Service manifest types
//!
//! The manifest is the compose file applied on the target host. The keys
//! the pipeline reads are modelled; every other key is carried through
//! `extra` untouched, so a manifest written back to the host declares the
//! same stack it was read from. Everything is optional so partial files
//! still parse and [`super::ManifestParser::validate`] reports what is
//! missing.

use crate::error::{Result, RolloutError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Name of the implicit network services join when none are listed
pub const DEFAULT_NETWORK: &str = "default";

/// Keys not modelled explicitly, kept verbatim
pub type Extra = BTreeMap<String, serde_yaml::Value>;

/// Declarative multi-service definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Compose file version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Project name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Services
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    /// Networks
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, Option<NetworkConfig>>,
    /// Volumes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, Option<serde_yaml::Value>>,
    /// Secrets, configs and `x-` extension fields
    #[serde(flatten)]
    pub extra: Extra,
}

/// Service definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Image reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Build configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildConfig>,
    /// Command to run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandConfig>,
    /// Entrypoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<CommandConfig>,
    /// Container name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    /// Environment variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentConfig>,
    /// Environment files, relative to the manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_file: Option<EnvFileConfig>,
    /// Port mappings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<PortConfig>>,
    /// Ports exposed to the network only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expose: Option<Vec<PortValue>>,
    /// Networks to join
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networks: Option<NetworksConfig>,
    /// Start-order dependencies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<DependsOnConfig>,
    /// Restart policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    /// Labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<LabelsConfig>,
    /// Healthcheck
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthcheckConfig>,
    /// Volume mounts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<VolumeMount>>,
    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// User
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// `deploy`, `logging` and everything else
    #[serde(flatten)]
    pub extra: Extra,
}

/// Build configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildConfig {
    /// Context path only
    Simple(String),
    /// Full build configuration
    Full(BuildConfigFull),
}

/// Full build configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildConfigFull {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    /// Build args, target and the rest
    #[serde(flatten)]
    pub extra: Extra,
}

/// Command configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    /// Shell command string
    Shell(String),
    /// Exec form array
    Exec(Vec<String>),
}

/// Scalar value compose accepts where a string is meant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    String(String),
    Number(serde_yaml::Number),
    Bool(bool),
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::String(s) => f.write_str(s),
            ScalarValue::Number(n) => write!(f, "{}", n),
            ScalarValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Environment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// Array of KEY=value strings
    Array(Vec<String>),
    /// Map of key to value
    Map(BTreeMap<String, Option<ScalarValue>>),
}

/// Env file configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvFileConfig {
    /// Single file
    Single(String),
    /// Multiple files
    Multiple(Vec<String>),
}

/// Port number or range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(u16),
    Text(String),
}

/// Port configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    /// Short syntax: "8080:80"
    Short(PortValue),
    /// Long syntax
    Long(PortConfigLong),
}

/// Long port configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortConfigLong {
    /// Port in the container
    pub target: u16,
    /// Port published on the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<PortValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// Volume mount configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VolumeMount {
    /// Short syntax: "source:target:mode"
    Short(String),
    /// Long syntax
    Long(VolumeMountLong),
}

/// Long volume mount configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMountLong {
    /// Mount type (volume, bind, tmpfs)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub mount_type: Option<String>,
    /// Source path or volume name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Path in the container
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    /// `bind`, `volume` and `tmpfs` options
    #[serde(flatten)]
    pub extra: Extra,
}

impl VolumeMount {
    /// Named volume this mount uses, if any
    pub fn named_volume(&self) -> Option<String> {
        match self {
            VolumeMount::Short(spec) => {
                let (source, _) = spec.split_once(':')?;
                is_volume_name(source).then(|| source.to_string())
            }
            VolumeMount::Long(long) => match long.mount_type.as_deref() {
                Some("volume") | None => long
                    .source
                    .as_deref()
                    .filter(|s| is_volume_name(s))
                    .map(str::to_string),
                _ => None,
            },
        }
    }
}

/// Bind sources are paths; volume names are not
fn is_volume_name(source: &str) -> bool {
    !source.is_empty() && !source.starts_with(['.', '/', '~', '$'])
}

/// Service network membership
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetworksConfig {
    /// Array of network names
    Array(Vec<String>),
    /// Map of network name to aliases
    Map(BTreeMap<String, Option<ServiceNetworkConfig>>),
}

/// Per-network settings of a service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceNetworkConfig {
    /// Extra names the service resolves as on this network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// Depends on configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    /// Array of service names
    Array(Vec<String>),
    /// Map of service to condition
    Map(BTreeMap<String, DependsOnCondition>),
}

/// Depends on condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependsOnCondition {
    /// Condition to wait for
    pub condition: String,
    /// `restart` and `required`
    #[serde(flatten)]
    pub extra: Extra,
}

/// Labels configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelsConfig {
    /// Array of "key=value" strings
    Array(Vec<String>),
    /// Map of key to value
    Map(BTreeMap<String, String>),
}

/// Healthcheck configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    /// Test command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<HealthcheckTest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// `start_period`, `disable`
    #[serde(flatten)]
    pub extra: Extra,
}

/// Healthcheck test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HealthcheckTest {
    /// Command string
    Command(String),
    /// Command array
    Array(Vec<String>),
}

/// Top-level network declaration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    /// Internal network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal: Option<bool>,
    /// External network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<bool>,
    /// `name`, `ipam`, `driver_opts` and the rest
    #[serde(flatten)]
    pub extra: Extra,
}

impl DependsOnConfig {
    /// Names of the services depended on
    pub fn services(&self) -> Vec<String> {
        match self {
            DependsOnConfig::Array(arr) => arr.clone(),
            DependsOnConfig::Map(map) => map.keys().cloned().collect(),
        }
    }
}

impl NetworksConfig {
    /// Names of the networks joined
    pub fn names(&self) -> Vec<String> {
        match self {
            NetworksConfig::Array(arr) => arr.clone(),
            NetworksConfig::Map(map) => map.keys().cloned().collect(),
        }
    }

    /// Aliases declared for a network
    pub fn aliases(&self, network: &str) -> Vec<String> {
        match self {
            NetworksConfig::Array(_) => Vec::new(),
            NetworksConfig::Map(map) => map
                .get(network)
                .and_then(|c| c.as_ref())
                .and_then(|c| c.aliases.clone())
                .unwrap_or_default(),
        }
    }
}

impl LabelsConfig {
    /// Labels as key/value pairs
    pub fn to_map(&self) -> BTreeMap<String, String> {
        match self {
            LabelsConfig::Map(map) => map.clone(),
            LabelsConfig::Array(arr) => arr
                .iter()
                .map(|item| match item.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (item.clone(), String::new()),
                })
                .collect(),
        }
    }
}

impl EnvironmentConfig {
    /// Environment as key/value pairs; unset map entries are skipped
    pub fn to_map(&self) -> BTreeMap<String, String> {
        match self {
            EnvironmentConfig::Array(arr) => arr
                .iter()
                .filter_map(|item| item.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            EnvironmentConfig::Map(map) => map
                .iter()
                .filter_map(|(k, v)| v.as_ref().map(|v| (k.clone(), v.to_string())))
                .collect(),
        }
    }
}

impl ServiceConfig {
    /// Declared dependencies
    pub fn dependencies(&self) -> Vec<String> {
        self.depends_on
            .as_ref()
            .map(|d| d.services())
            .unwrap_or_default()
    }

    /// Networks this service joins
    pub fn network_names(&self) -> Vec<String> {
        match &self.networks {
            Some(networks) => networks.names(),
            None => vec![DEFAULT_NETWORK.to_string()],
        }
    }

    /// Labels as key/value pairs
    pub fn label_map(&self) -> BTreeMap<String, String> {
        self.labels.as_ref().map(|l| l.to_map()).unwrap_or_default()
    }
}

impl Manifest {
    /// Service start order based on `depends_on`
    pub fn start_order(&self) -> Result<Vec<String>> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut visiting = HashSet::new();

        for service_name in self.services.keys() {
            self.topological_sort(service_name, &mut visited, &mut visiting, &mut order)?;
        }

        Ok(order)
    }

    fn topological_sort(
        &self,
        service: &str,
        visited: &mut HashSet<String>,
        visiting: &mut HashSet<String>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        if visited.contains(service) {
            return Ok(());
        }

        if visiting.contains(service) {
            return Err(RolloutError::Manifest(format!(
                "Circular dependency detected for service: {}",
                service
            )));
        }

        visiting.insert(service.to_string());

        if let Some(service_config) = self.services.get(service) {
            for dep in service_config.dependencies() {
                self.topological_sort(&dep, visited, visiting, order)?;
            }
        }

        visiting.remove(service);
        visited.insert(service.to_string());
        order.push(service.to_string());

        Ok(())
    }

    /// Networks a service joins
    pub fn networks_of(&self, service: &str) -> Result<Vec<String>> {
        self.services
            .get(service)
            .map(|s| s.network_names())
            .ok_or_else(|| RolloutError::Manifest(format!("Unknown service: {}", service)))
    }

    /// Copy with the given services' images replaced
    pub fn with_images(&self, images: &BTreeMap<String, String>) -> Result<Manifest> {
        let mut result = self.clone();
        for (service, image) in images {
            let config = result
                .services
                .get_mut(service)
                .ok_or_else(|| RolloutError::Manifest(format!("Unknown service: {}", service)))?;
            config.image = Some(image.clone());
            // the host pulls, it never builds
            config.build = None;
        }
        Ok(result)
    }

    /// Copy with a label stamped on every service
    pub fn with_label(&self, key: &str, value: &str) -> Manifest {
        let mut result = self.clone();
        for service in result.services.values_mut() {
            let mut labels = service.label_map();
            labels.insert(key.to_string(), value.to_string());
            service.labels = Some(LabelsConfig::Map(labels));
        }
        result
    }

    /// Serialize back to compose YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
