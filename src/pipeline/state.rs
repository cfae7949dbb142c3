//! Pipeline stages and the transitions between them

use serde::{Deserialize, Serialize};

/// Stage of a deployment run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Waiting for a trigger
    Idle,
    /// Logging in to the registry
    Authenticating,
    /// Building images
    Building,
    /// Pushing images
    Publishing,
    /// Opening the remote channel
    Connecting,
    /// Removing containers and pruning images
    TearingDown,
    /// Applying the manifest, pulling and starting services
    Converging,
    /// Checking what runs
    Verifying,
    /// Finished successfully
    Done,
    /// Stopped on an error
    Failed,
}

impl Stage {
    /// Stages in pipeline order, terminal states excluded
    pub const SEQUENCE: [Stage; 8] = [
        Stage::Idle,
        Stage::Authenticating,
        Stage::Building,
        Stage::Publishing,
        Stage::Connecting,
        Stage::TearingDown,
        Stage::Converging,
        Stage::Verifying,
    ];

    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }

    /// Whether the host may have been modified once this stage is entered
    pub fn mutates_host(&self) -> bool {
        matches!(
            self,
            Stage::TearingDown | Stage::Converging | Stage::Verifying | Stage::Done
        )
    }

    /// Stage that follows on success
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Verifying => Some(Stage::Done),
            Stage::Done | Stage::Failed => None,
            other => Stage::SEQUENCE
                .iter()
                .position(|s| s == other)
                .and_then(|i| Stage::SEQUENCE.get(i + 1).copied()),
        }
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(&self, next: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == Stage::Failed {
            return *self != Stage::Idle;
        }
        self.next() == Some(next)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::Authenticating => "authenticating",
            Stage::Building => "building",
            Stage::Publishing => "publishing",
            Stage::Connecting => "connecting",
            Stage::TearingDown => "tearing down",
            Stage::Converging => "converging",
            Stage::Verifying => "verifying",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_chain() {
        let mut stage = Stage::Idle;
        let mut visited = vec![stage];
        while let Some(next) = stage.next() {
            assert!(stage.can_transition_to(next));
            stage = next;
            visited.push(stage);
        }
        assert_eq!(stage, Stage::Done);
        assert_eq!(visited.len(), 9);
    }

    #[test]
    fn test_no_skipping_or_going_back() {
        assert!(!Stage::Building.can_transition_to(Stage::Connecting));
        assert!(!Stage::Converging.can_transition_to(Stage::TearingDown));
        assert!(!Stage::Idle.can_transition_to(Stage::Building));
    }

    #[test]
    fn test_failure_edges() {
        for stage in Stage::SEQUENCE.iter().skip(1) {
            assert!(stage.can_transition_to(Stage::Failed), "{}", stage);
        }
        assert!(!Stage::Idle.can_transition_to(Stage::Failed));
    }

    #[test]
    fn test_terminal_states() {
        for terminal in [Stage::Done, Stage::Failed] {
            assert!(terminal.is_terminal());
            assert!(terminal.next().is_none());
            for stage in Stage::SEQUENCE {
                assert!(!terminal.can_transition_to(stage));
            }
            assert!(!terminal.can_transition_to(Stage::Failed));
        }
    }

    #[test]
    fn test_mutates_host() {
        assert!(!Stage::Connecting.mutates_host());
        assert!(Stage::TearingDown.mutates_host());
    }
}
