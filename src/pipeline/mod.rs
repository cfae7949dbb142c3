//! Deployment pipeline
//!
//! A push to the designated branch starts one run of the sequencer:
//! authenticate, build, publish, connect, tear down, converge, verify.

pub mod history;
pub mod policy;
pub mod run;
pub mod sequencer;
pub mod state;
pub mod steps;
pub mod trigger;

pub use history::{Release, ReleaseHistory};
pub use policy::{DeployPolicy, LockPolicy, TeardownMode, VerifyMode};
pub use run::{abbreviate, Outcome, PipelineRun, StepRecord, StepStatus};
pub use sequencer::{DeploymentPlan, DeploymentSequencer};
pub use state::Stage;
pub use steps::{ImageBuilder, Registry, RegistryCredentials};
pub use trigger::{Dispatch, PushEvent, TriggerFilter, TriggerLedger};
