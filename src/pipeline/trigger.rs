//! Push events and the branch filter that starts pipeline runs
//!
//! A delivery is dispatched at most once: the ledger remembers the most
//! recent delivery IDs, so a webhook retried by the sender does not start
//! a second deployment.

use crate::error::{Result, RolloutError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Delivery IDs remembered by the ledger
pub const LEDGER_CAPACITY: usize = 256;

const BRANCH_PREFIX: &str = "refs/heads/";

/// A push to the repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
    /// Unique delivery identifier
    pub delivery_id: String,
    /// Full ref, e.g. `refs/heads/main`
    pub git_ref: String,
    /// Head commit after the push
    pub commit: String,
    /// Who pushed
    #[serde(default)]
    pub pusher: Option<String>,
}

/// Webhook payload fields the trigger reads
#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    after: String,
    #[serde(default)]
    pusher: Option<WebhookPusher>,
}

#[derive(Debug, Deserialize)]
struct WebhookPusher {
    name: String,
}

impl PushEvent {
    pub fn new(delivery_id: &str, git_ref: &str, commit: &str) -> Self {
        Self {
            delivery_id: delivery_id.to_string(),
            git_ref: git_ref.to_string(),
            commit: commit.to_string(),
            pusher: None,
        }
    }

    /// Parse a push webhook body
    pub fn from_webhook(delivery_id: &str, body: &str) -> Result<Self> {
        let payload: WebhookPayload = serde_json::from_str(body)?;
        Ok(Self {
            delivery_id: delivery_id.to_string(),
            git_ref: payload.git_ref,
            commit: payload.after,
            pusher: payload.pusher.map(|p| p.name),
        })
    }

    /// Branch name, if the ref is a branch
    pub fn branch(&self) -> Option<&str> {
        self.git_ref.strip_prefix(BRANCH_PREFIX)
    }

    /// Whether the push deleted the ref
    pub fn is_deletion(&self) -> bool {
        !self.commit.is_empty() && self.commit.chars().all(|c| c == '0')
    }
}

/// Accepts pushes to the designated branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerFilter {
    branch: String,
}

impl TriggerFilter {
    pub fn new(branch: &str) -> Self {
        Self {
            branch: branch.to_string(),
        }
    }

    pub fn accepts(&self, event: &PushEvent) -> bool {
        event.branch() == Some(self.branch.as_str()) && !event.is_deletion()
    }
}

/// Why an event did or did not start a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Start a run
    Run,
    /// The event is not for the designated branch
    Ignored,
    /// This delivery was already dispatched
    Duplicate,
}

/// Delivery IDs already dispatched
#[derive(Debug, Default)]
pub struct TriggerLedger {
    path: Option<PathBuf>,
    seen: VecDeque<String>,
}

impl TriggerLedger {
    /// Ledger kept only in memory
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load a ledger from disk; a missing file is an empty ledger
    pub fn open(path: &Path) -> Result<Self> {
        let seen = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            VecDeque::new()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            seen,
        })
    }

    pub fn contains(&self, delivery_id: &str) -> bool {
        self.seen.iter().any(|id| id == delivery_id)
    }

    /// Decide whether an event starts a run, and remember it if so
    pub fn dispatch(&mut self, filter: &TriggerFilter, event: &PushEvent) -> Result<Dispatch> {
        if !filter.accepts(event) {
            debug!("Ignoring push to {}", event.git_ref);
            return Ok(Dispatch::Ignored);
        }
        if event.delivery_id.is_empty() {
            return Err(RolloutError::InvalidConfig(
                "push event has no delivery id".to_string(),
            ));
        }
        if self.contains(&event.delivery_id) {
            info!("Delivery {} already dispatched", event.delivery_id);
            return Ok(Dispatch::Duplicate);
        }

        self.seen.push_back(event.delivery_id.clone());
        while self.seen.len() > LEDGER_CAPACITY {
            self.seen.pop_front();
        }
        self.save()?;
        Ok(Dispatch::Run)
    }

    fn save(&self) -> Result<()> {
        if let Some(ref path) = self.path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, serde_json::to_string(&self.seen)?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_from_webhook() {
        let body = r#"{
            "ref": "refs/heads/main",
            "before": "1111111111111111111111111111111111111111",
            "after": "2222222222222222222222222222222222222222",
            "pusher": {"name": "octocat", "email": "octocat@example.com"},
            "repository": {"full_name": "user/mean-stack"}
        }"#;
        let event = PushEvent::from_webhook("delivery-1", body).unwrap();
        assert_eq!(event.branch(), Some("main"));
        assert_eq!(event.pusher.as_deref(), Some("octocat"));
        assert!(!event.is_deletion());
    }

    #[test]
    fn test_filter() {
        let filter = TriggerFilter::new("main");
        assert!(filter.accepts(&PushEvent::new("1", "refs/heads/main", "abc")));
        assert!(!filter.accepts(&PushEvent::new("2", "refs/heads/dev", "abc")));
        assert!(!filter.accepts(&PushEvent::new("3", "refs/tags/main", "abc")));
        assert!(!filter.accepts(&PushEvent::new(
            "4",
            "refs/heads/main",
            "0000000000000000000000000000000000000000"
        )));
    }

    #[test]
    fn test_one_push_one_run() {
        let filter = TriggerFilter::new("main");
        let mut ledger = TriggerLedger::in_memory();
        let event = PushEvent::new("delivery-9", "refs/heads/main", "abc");

        assert_eq!(ledger.dispatch(&filter, &event).unwrap(), Dispatch::Run);
        assert_eq!(ledger.dispatch(&filter, &event).unwrap(), Dispatch::Duplicate);

        let other = PushEvent::new("delivery-10", "refs/heads/feature", "def");
        assert_eq!(ledger.dispatch(&filter, &other).unwrap(), Dispatch::Ignored);
        assert!(!ledger.contains("delivery-10"));
    }

    #[test]
    fn test_ledger_persists_and_is_bounded() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("state").join("deliveries.json");
        let filter = TriggerFilter::new("main");

        let mut ledger = TriggerLedger::open(&path).unwrap();
        for i in 0..(LEDGER_CAPACITY + 4) {
            let event = PushEvent::new(&format!("d{}", i), "refs/heads/main", "abc");
            ledger.dispatch(&filter, &event).unwrap();
        }

        let reopened = TriggerLedger::open(&path).unwrap();
        assert!(!reopened.contains("d0"));
        assert!(reopened.contains(&format!("d{}", LEDGER_CAPACITY + 3)));
        assert_eq!(reopened.seen.len(), LEDGER_CAPACITY);
    }
}
