//! Record of one pipeline execution

use super::state::Stage;
use super::trigger::PushEvent;
use crate::error::{FailureKind, Result, RolloutError};
use crate::host::RunningContainer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use tracing::{info, warn};
use uuid::Uuid;

/// At most `chars` leading characters of `s`
pub fn abbreviate(s: &str, chars: usize) -> &str {
    s.char_indices().nth(chars).map_or(s, |(end, _)| &s[..end])
}

/// Step status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Success,
    Failed,
}

/// One executed step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step identifier (e.g. "build:api", "teardown")
    pub name: String,
    /// Stage the step ran in
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub status: StepStatus,
    pub message: Option<String>,
}

/// Stage change with its time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub stage: Stage,
    pub at: DateTime<Utc>,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    /// Still running
    Pending,
    /// Every step succeeded
    Succeeded,
    /// A step failed; the pipeline stopped there
    Failed { kind: FailureKind, message: String },
    /// Verification failed and the previous release was re-applied
    RolledBack {
        kind: FailureKind,
        message: String,
        restored_run: String,
    },
}

/// Pipeline execution record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Run ID
    pub id: String,
    pub project: String,
    pub commit: String,
    pub branch: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Current stage
    pub stage: Stage,
    pub transitions: Vec<Transition>,
    pub steps: Vec<StepRecord>,
    /// Service to published reference
    pub images: BTreeMap<String, String>,
    /// Containers observed during verification
    pub running: Vec<RunningContainer>,
    pub outcome: Outcome,
}

impl PipelineRun {
    /// Start a record for a push
    pub fn new(project: &str, event: &PushEvent) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            project: project.to_string(),
            commit: event.commit.clone(),
            branch: event.branch().unwrap_or(&event.git_ref).to_string(),
            started_at: now,
            finished_at: None,
            stage: Stage::Idle,
            transitions: vec![Transition {
                stage: Stage::Idle,
                at: now,
            }],
            steps: Vec::new(),
            images: BTreeMap::new(),
            running: Vec::new(),
            outcome: Outcome::Pending,
        }
    }

    /// First eight characters of the run ID
    pub fn short_id(&self) -> &str {
        abbreviate(&self.id, 8)
    }

    /// Move to the next stage
    pub fn enter(&mut self, stage: Stage) -> Result<()> {
        if !self.stage.can_transition_to(stage) {
            return Err(RolloutError::Internal(format!(
                "illegal transition {} -> {}",
                self.stage, stage
            )));
        }
        info!("[{}] {} -> {}", self.short_id(), self.stage, stage);
        self.stage = stage;
        self.transitions.push(Transition {
            stage,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Run one step, recording its timing and result
    pub async fn step<T, F>(&mut self, name: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Utc::now();
        self.steps.push(StepRecord {
            name: name.to_string(),
            stage: self.stage,
            started_at: started,
            finished_at: None,
            duration_ms: None,
            status: StepStatus::Running,
            message: None,
        });
        let index = self.steps.len() - 1;

        let result = fut.await;

        let now = Utc::now();
        let record = &mut self.steps[index];
        record.finished_at = Some(now);
        record.duration_ms = Some((now - started).num_milliseconds());
        match &result {
            Ok(_) => record.status = StepStatus::Success,
            Err(e) => {
                record.status = StepStatus::Failed;
                record.message = Some(e.to_string());
                warn!("[{}] step {} failed: {}", self.short_id(), name, e);
            }
        }
        result
    }

    /// Attach a note to the most recent step
    pub fn note(&mut self, message: impl Into<String>) {
        if let Some(last) = self.steps.last_mut() {
            last.message = Some(message.into());
        }
    }

    /// Close the run as successful
    pub fn succeed(&mut self) -> Result<()> {
        self.enter(Stage::Done)?;
        self.outcome = Outcome::Succeeded;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Close the run with a failure
    pub fn fail(&mut self, error: &RolloutError) {
        self.close_failed(Outcome::Failed {
            kind: error.failure_kind(),
            message: error.to_string(),
        });
    }

    /// Close the run as rolled back
    pub fn roll_back(&mut self, error: &RolloutError, restored_run: &str) {
        self.close_failed(Outcome::RolledBack {
            kind: error.failure_kind(),
            message: error.to_string(),
            restored_run: restored_run.to_string(),
        });
    }

    fn close_failed(&mut self, outcome: Outcome) {
        if self.stage.can_transition_to(Stage::Failed) {
            self.stage = Stage::Failed;
            self.transitions.push(Transition {
                stage: Stage::Failed,
                at: Utc::now(),
            });
        } else {
            // a failure before leaving Idle still ends the run
            self.stage = Stage::Failed;
        }
        self.outcome = outcome;
        self.finished_at = Some(Utc::now());
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == Outcome::Succeeded
    }

    /// Whether a step with this name ran
    pub fn ran(&self, step: &str) -> bool {
        self.steps.iter().any(|s| s.name == step)
    }

    /// Stages visited, in order
    pub fn stages(&self) -> Vec<Stage> {
        self.transitions.iter().map(|t| t.stage).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> PushEvent {
        PushEvent::new("d-1", "refs/heads/main", "abc123")
    }

    #[tokio::test]
    async fn test_step_records_success_and_failure() {
        let mut run = PipelineRun::new("shop", &event());
        run.enter(Stage::Authenticating).unwrap();

        let value = run.step("login", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);

        let result: Result<()> = run
            .step("push", async {
                Err(RolloutError::Publish {
                    image: "user/api".to_string(),
                    message: "denied".to_string(),
                })
            })
            .await;
        assert!(result.is_err());

        assert_eq!(run.steps[0].status, StepStatus::Success);
        assert_eq!(run.steps[1].status, StepStatus::Failed);
        assert!(run.steps[1].message.as_deref().unwrap().contains("denied"));
        assert!(run.ran("login"));
        assert!(!run.ran("teardown"));
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut run = PipelineRun::new("shop", &event());
        assert!(run.enter(Stage::Building).is_err());
        assert_eq!(run.stage, Stage::Idle);
    }

    #[test]
    fn test_fail_closes_run() {
        let mut run = PipelineRun::new("shop", &event());
        run.enter(Stage::Authenticating).unwrap();
        run.fail(&RolloutError::Authentication("bad token".to_string()));

        assert_eq!(run.stage, Stage::Failed);
        assert!(run.finished_at.is_some());
        assert!(!run.succeeded());
        assert_eq!(
            run.stages(),
            vec![Stage::Idle, Stage::Authenticating, Stage::Failed]
        );
        match &run.outcome {
            Outcome::Failed { kind, .. } => assert_eq!(*kind, FailureKind::Authentication),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_branch_from_ref() {
        let run = PipelineRun::new("shop", &event());
        assert_eq!(run.branch, "main");
        assert_eq!(run.short_id().len(), 8);

        let json = serde_json::to_string(&run).unwrap();
        assert!(json.contains("\"result\":\"pending\""));
    }

    #[test]
    fn test_abbreviate_respects_char_boundaries() {
        assert_eq!(abbreviate("0123456789abcdef", 12), "0123456789ab");
        assert_eq!(abbreviate("abc", 12), "abc");
        let commit = format!("a{}-hotfix", "é".repeat(12));
        assert_eq!(abbreviate(&commit, 12), format!("a{}", "é".repeat(11)));
        assert_eq!(abbreviate("", 8), "");

        let mut run = PipelineRun::new("shop", &event());
        run.id = "réléase-ünicode".to_string();
        assert_eq!(run.short_id(), "réléase-");
    }
}
