//! Deployment policy
//!
//! The default policy reproduces the plain pipeline: host-wide teardown,
//! mutable tags, a container listing that never fails the run, and no
//! coordination between runs. [`DeployPolicy::hardened`] turns on the
//! safeguards.

use crate::host::TeardownScope;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How teardown selects containers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownMode {
    /// Remove every container on the host
    #[default]
    HostWide,
    /// Remove only containers labelled with the project
    Labeled,
}

impl TeardownMode {
    pub fn scope(&self, project: &str) -> TeardownScope {
        match self {
            TeardownMode::HostWide => TeardownScope::HostWide,
            TeardownMode::Labeled => TeardownScope::for_stack(project),
        }
    }
}

/// What the verify stage does
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum VerifyMode {
    /// List containers; never affects the outcome
    #[default]
    Observational,
    /// Poll readiness of every declared service
    Gated {
        timeout_secs: u64,
        interval_secs: u64,
    },
}

impl VerifyMode {
    pub fn is_gated(&self) -> bool {
        matches!(self, VerifyMode::Gated { .. })
    }
}

/// Deployment lock settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPolicy {
    /// How long to wait for another run to finish
    pub timeout_secs: u64,
    /// Delay between attempts, in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            poll_interval_ms: 2000,
        }
    }
}

impl LockPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Deployment policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployPolicy {
    /// Teardown scope
    pub teardown: TeardownMode,
    /// Deploy by digest instead of mutable tag
    pub pin_digests: bool,
    /// Verify stage behaviour
    pub verify: VerifyMode,
    /// Serialize runs against the same host
    pub lock: Option<LockPolicy>,
    /// Re-apply the previous release when gated verification fails
    pub rollback: bool,
}

impl DeployPolicy {
    /// Every safeguard on
    pub fn hardened() -> Self {
        Self {
            teardown: TeardownMode::Labeled,
            pin_digests: true,
            verify: VerifyMode::Gated {
                timeout_secs: 120,
                interval_secs: 2,
            },
            lock: Some(LockPolicy::default()),
            rollback: true,
        }
    }
}
