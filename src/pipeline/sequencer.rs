//! Deployment sequencer
//!
//! Drives one pipeline run through its stages in order. Every step runs
//! to completion before the next starts, and the first failure ends the
//! run; nothing is retried. Host mutation starts at teardown, so a run
//! that fails to connect has not touched the host. A failure after
//! teardown leaves the stack down.

use super::history::{Release, ReleaseHistory};
use super::policy::{DeployPolicy, LockPolicy, VerifyMode};
use super::run::{abbreviate, PipelineRun};
use super::state::Stage;
use super::steps::{ImageBuilder, Registry, RegistryCredentials};
use super::trigger::PushEvent;
use crate::error::{Result, RolloutError};
use crate::host::{
    local_hostname, process_alive, Connector, HostSession, HostTarget, LockHolder,
    RunningContainer, TeardownScope,
};
use crate::image::{content_tag, BuildSpec, Digest, ImageRef, DEFAULT_TAG};
use crate::manifest::Manifest;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Everything a run needs to know about the stack and its target
#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    /// Project name, used for container names and the teardown label
    pub project: String,
    /// Declared services
    pub manifest: Manifest,
    /// Images built and published by the pipeline
    pub builds: Vec<BuildSpec>,
    pub credentials: RegistryCredentials,
    pub target: HostTarget,
    pub policy: DeployPolicy,
}

/// An image after publishing
#[derive(Debug, Clone)]
struct Published {
    service: String,
    image: ImageRef,
    digest: Digest,
}

/// Runs the pipeline against a builder, a registry and a host
pub struct DeploymentSequencer<B, R, C> {
    builder: B,
    registry: R,
    connector: C,
    plan: DeploymentPlan,
    history: ReleaseHistory,
}

impl<B, R, C> DeploymentSequencer<B, R, C>
where
    B: ImageBuilder,
    R: Registry,
    C: Connector,
{
    pub fn new(builder: B, registry: R, connector: C, plan: DeploymentPlan) -> Self {
        Self {
            builder,
            registry,
            connector,
            plan,
            history: ReleaseHistory::in_memory(),
        }
    }

    /// Use a persisted release history
    pub fn with_history(mut self, history: ReleaseHistory) -> Self {
        self.history = history;
        self
    }

    pub fn plan(&self) -> &DeploymentPlan {
        &self.plan
    }

    pub fn history(&self) -> &ReleaseHistory {
        &self.history
    }

    /// Run the pipeline once for a push
    ///
    /// The returned record is always terminal: `Done` when every step
    /// succeeded, `Failed` otherwise.
    pub async fn run(&mut self, event: &PushEvent) -> PipelineRun {
        let mut run = PipelineRun::new(&self.plan.project, event);
        info!(
            "[{}] Deploying {} ({}) to {}",
            run.short_id(),
            run.commit,
            run.branch,
            self.plan.target.destination()
        );

        if let Err(e) = self.execute(&mut run).await {
            error!("[{}] Deployment failed: {}", run.short_id(), e);
            if run.stage.mutates_host() {
                warn!(
                    "[{}] Failed during {}; the stack on {} may be down",
                    run.short_id(),
                    run.stage,
                    self.plan.target.address
                );
            }
            run.fail(&e);
        }
        run
    }

    async fn execute(&mut self, run: &mut PipelineRun) -> Result<()> {
        let published = self.produce_images(run).await?;

        run.enter(Stage::Connecting)?;
        let session = run
            .step("connect", self.connector.connect(&self.plan.target))
            .await?;

        let holder = match self.plan.policy.lock {
            Some(lock) => Some(self.acquire_lock(run, &session, &lock).await?),
            None => None,
        };

        let result = self.apply(run, &session, &published).await;

        if let Some(holder) = holder {
            if let Err(e) = session.unlock(&holder).await {
                warn!("[{}] Failed to release deployment lock: {}", run.short_id(), e);
            }
        }
        result
    }

    /// Authenticate, build and publish
    async fn produce_images(&self, run: &mut PipelineRun) -> Result<Vec<Published>> {
        run.enter(Stage::Authenticating)?;
        run.step(
            "authenticate",
            self.registry.authenticate(&self.plan.credentials),
        )
        .await?;

        run.enter(Stage::Building)?;
        let mut built = Vec::with_capacity(self.plan.builds.len());
        for spec in &self.plan.builds {
            let name = format!("build:{}", spec.service);
            let spec = run.step(&name, self.build(spec)).await?;
            built.push(spec);
        }

        run.enter(Stage::Publishing)?;
        let mut published = Vec::with_capacity(built.len());
        for spec in built {
            let name = format!("publish:{}", spec.service);
            let digest = run.step(&name, self.registry.publish(&spec.image)).await?;
            let deployed = if self.plan.policy.pin_digests {
                spec.image.pinned(&digest)
            } else {
                spec.image.clone()
            };
            run.note(format!("{} -> {}", spec.image, digest));
            run.images.insert(spec.service.clone(), deployed.to_string());
            published.push(Published {
                service: spec.service,
                image: spec.image,
                digest,
            });
        }
        Ok(published)
    }

    async fn build(&self, spec: &BuildSpec) -> Result<BuildSpec> {
        let mut spec = spec.clone();
        if self.plan.policy.pin_digests {
            let tag = content_tag(&spec).map_err(|e| RolloutError::Build {
                service: spec.service.clone(),
                message: format!("cannot hash {}: {}", spec.context.display(), e),
            })?;
            spec.image = spec.image.with_tag(&tag);
        }
        self.builder.build(&spec).await?;
        Ok(spec)
    }

    async fn acquire_lock(
        &self,
        run: &mut PipelineRun,
        session: &C::Session,
        policy: &LockPolicy,
    ) -> Result<String> {
        let holder = LockHolder::current(&run.id).to_string();
        let local_host = local_hostname();
        let deadline = Instant::now() + policy.timeout();

        let acquire = async {
            loop {
                if session.try_lock(&holder).await? {
                    return Ok(());
                }
                if let Some(current) = session.lock_holder().await? {
                    let stale = LockHolder::parse(&current)
                        .is_some_and(|h| h.is_stale(&local_host, process_alive));
                    if stale {
                        warn!("Breaking stale deployment lock held by {}", current);
                        session.unlock(&current).await?;
                        continue;
                    }
                }
                if Instant::now() >= deadline {
                    return Err(RolloutError::Lock(format!(
                        "another deployment held the lock for more than {}s",
                        policy.timeout_secs
                    )));
                }
                tokio::time::sleep(policy.poll_interval()).await;
            }
        };
        run.step("lock", acquire).await?;
        Ok(holder)
    }

    /// Teardown, converge and verify on a connected host
    async fn apply(
        &mut self,
        run: &mut PipelineRun,
        session: &C::Session,
        published: &[Published],
    ) -> Result<()> {
        let scope = self.plan.policy.teardown.scope(&self.plan.project);

        run.enter(Stage::TearingDown)?;
        let removed = run
            .step("remove containers", session.remove_containers(&scope))
            .await?;
        run.note(format!("removed {} containers ({})", removed, scope));
        run.step("prune images", session.prune_images(&scope))
            .await?;

        run.enter(Stage::Converging)?;
        let yaml = self.render(&run.images, &scope)?;
        Self::converge(run, session, &yaml, "").await?;

        run.enter(Stage::Verifying)?;
        if let VerifyMode::Gated {
            timeout_secs,
            interval_secs,
        } = self.plan.policy.verify
        {
            let services = self.plan.manifest.services.keys().cloned().collect::<Vec<_>>();
            let wait = Self::wait_ready(
                session,
                &services,
                Duration::from_secs(timeout_secs),
                Duration::from_secs(interval_secs),
            );
            if let Err(e) = run.step("wait ready", wait).await {
                return self.recover(run, session, &scope, e).await;
            }
        }
        self.observe(run, session).await;

        if self.plan.policy.pin_digests {
            for image in published {
                let name = format!("alias:{}", image.service);
                let source = image.image.pinned(&image.digest);
                let alias = image.image.with_tag(DEFAULT_TAG);
                run.step(&name, self.registry.alias(&source, &alias)).await?;
            }
        }

        run.succeed()?;

        let release = Release {
            run_id: run.id.clone(),
            commit: run.commit.clone(),
            images: run.images.clone(),
            finished_at: run.finished_at.unwrap_or(run.started_at),
        };
        if let Err(e) = self.history.record(release) {
            warn!("[{}] Failed to record release: {}", run.short_id(), e);
        }
        info!("[{}] Deployment complete", run.short_id());
        Ok(())
    }

    /// Manifest as written to the host
    fn render(&self, images: &BTreeMap<String, String>, scope: &TeardownScope) -> Result<String> {
        let mut manifest = self.plan.manifest.with_images(images)?;
        if manifest.name.is_none() {
            manifest.name = Some(self.plan.project.clone());
        }
        if let TeardownScope::Labeled { key, value } = scope {
            manifest = manifest.with_label(key, value);
        }
        manifest.to_yaml()
    }

    async fn converge(
        run: &mut PipelineRun,
        session: &C::Session,
        yaml: &str,
        prefix: &str,
    ) -> Result<()> {
        run.step(&format!("{}write manifest", prefix), session.write_manifest(yaml))
            .await?;
        run.step(&format!("{}pull", prefix), session.pull_images())
            .await?;
        run.step(&format!("{}up", prefix), session.up()).await?;
        Ok(())
    }

    async fn wait_ready(
        session: &C::Session,
        services: &[String],
        timeout: Duration,
        interval: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut pending = services.to_vec();

        loop {
            let mut not_ready = Vec::new();
            for service in pending {
                if !session.service_ready(&service).await? {
                    not_ready.push(service);
                }
            }
            pending = not_ready;

            if pending.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RolloutError::Verification(format!(
                    "not ready after {}s: {}",
                    timeout.as_secs(),
                    pending.join(", ")
                )));
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// List what runs; never fails the run
    async fn observe(&self, run: &mut PipelineRun, session: &C::Session) {
        let running = match run.step("list running", session.list_running()).await {
            Ok(running) => running,
            Err(e) => {
                warn!("[{}] Could not list containers: {}", run.short_id(), e);
                return;
            }
        };

        for container in &running {
            info!(
                "[{}] running {} ({}) {}",
                run.short_id(),
                container.name,
                abbreviate(&container.id, 12),
                container.image
            );
        }

        let missing = missing_services(&self.plan.manifest, &running);
        if !missing.is_empty() {
            warn!(
                "[{}] Declared services not running: {}",
                run.short_id(),
                missing.join(", ")
            );
            run.note(format!("not running: {}", missing.join(", ")));
        }
        run.running = running;
    }

    /// Re-apply the last good release after a failed verification
    async fn recover(
        &self,
        run: &mut PipelineRun,
        session: &C::Session,
        scope: &TeardownScope,
        error: RolloutError,
    ) -> Result<()> {
        let previous = match self.history.latest() {
            Some(release) if self.plan.policy.rollback => release.clone(),
            _ => return Err(error),
        };

        warn!(
            "[{}] Rolling back to release {} ({})",
            run.short_id(),
            previous.run_id,
            previous.commit
        );
        let restored = match self.render(&previous.images, scope) {
            Ok(yaml) => Self::converge(run, session, &yaml, "rollback:").await,
            Err(e) => Err(e),
        };

        if let Err(e) = restored {
            error!("[{}] Rollback failed: {}", run.short_id(), e);
            return Err(error);
        }
        self.observe(run, session).await;
        run.roll_back(&error, &previous.run_id);
        Ok(())
    }
}

/// Declared services with no running container
fn missing_services(manifest: &Manifest, running: &[RunningContainer]) -> Vec<String> {
    manifest
        .services
        .keys()
        .filter(|name| {
            !running
                .iter()
                .any(|c| c.service.as_deref() == Some(name.as_str()))
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::host::simulated::HostOpKind;
    use crate::host::{SimulatedHost, SimulatedRegistry, STACK_LABEL};
    use crate::manifest::ManifestParser;
    use crate::pipeline::policy::TeardownMode;
    use crate::pipeline::run::Outcome;
    use std::collections::HashSet;
    use std::path::Path;
    use tempfile::TempDir;

    const STACK: &str = r#"
services:
  mongo:
    image: mongo:6
    restart: always
    networks: [mean]
  api:
    build: ./backend
    image: user/mean-api:latest
    command: ["node", "server.js"]
    environment:
      - MONGO_URL=mongodb://mongo:27017/app
    depends_on: [mongo]
    networks: [mean]
    deploy:
      resources:
        limits:
          memory: 512m
  frontend:
    build: ./frontend
    image: user/mean-frontend:latest
    networks: [mean]
  proxy:
    image: nginx:alpine
    ports:
      - "80:80"
    depends_on: [api, frontend]
    networks: [mean]
networks:
  mean:
"#;

    type Sim = DeploymentSequencer<SimulatedRegistry, SimulatedRegistry, SimulatedHost>;

    struct Fixture {
        registry: SimulatedRegistry,
        host: SimulatedHost,
        _contexts: TempDir,
        root: std::path::PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = SimulatedRegistry::new();
            registry.seed(&ImageRef::parse("mongo:6").unwrap());
            registry.seed(&ImageRef::parse("nginx:alpine").unwrap());
            let host = SimulatedHost::new(registry.clone());

            let contexts = tempfile::tempdir().unwrap();
            for dir in ["backend", "frontend"] {
                std::fs::create_dir_all(contexts.path().join(dir)).unwrap();
                std::fs::write(contexts.path().join(dir).join("Dockerfile"), "FROM node:20\n")
                    .unwrap();
            }
            let root = contexts.path().to_path_buf();

            Self {
                registry,
                host,
                _contexts: contexts,
                root,
            }
        }

        fn plan(&self, policy: DeployPolicy) -> DeploymentPlan {
            plan_at(&self.root, policy)
        }

        fn sequencer(&self, policy: DeployPolicy) -> Sim {
            DeploymentSequencer::new(
                self.registry.clone(),
                self.registry.clone(),
                self.host.clone(),
                self.plan(policy),
            )
        }
    }

    fn plan_at(root: &Path, policy: DeployPolicy) -> DeploymentPlan {
        DeploymentPlan {
            project: "shop".to_string(),
            manifest: ManifestParser::parse_str(STACK).unwrap(),
            builds: vec![
                BuildSpec::new(
                    "api",
                    root.join("backend"),
                    ImageRef::parse("user/mean-api:latest").unwrap(),
                ),
                BuildSpec::new(
                    "frontend",
                    root.join("frontend"),
                    ImageRef::parse("user/mean-frontend:latest").unwrap(),
                ),
            ],
            credentials: RegistryCredentials {
                registry: None,
                username: "ci".to_string(),
                token: "token".to_string(),
            },
            target: HostTarget {
                address: "203.0.113.7".to_string(),
                user: "deploy".to_string(),
                port: 22,
                identity_file: None,
                workdir: "shop".to_string(),
            },
            policy,
        }
    }

    fn push(id: &str) -> PushEvent {
        PushEvent::new(id, "refs/heads/main", "0a1b2c3d")
    }

    fn failure_kind(run: &PipelineRun) -> Option<FailureKind> {
        match &run.outcome {
            Outcome::Failed { kind, .. } | Outcome::RolledBack { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    fn stack_ids(host: &SimulatedHost) -> HashSet<String> {
        host.containers()
            .into_iter()
            .filter(|c| c.service.is_some())
            .map(|c| c.id)
            .collect()
    }

    #[tokio::test]
    async fn test_successful_run_starts_all_services() {
        let fixture = Fixture::new();
        let mut sequencer = fixture.sequencer(DeployPolicy::default());

        let run = sequencer.run(&push("d1")).await;

        assert!(run.succeeded(), "{:?}", run.outcome);
        assert_eq!(
            run.stages(),
            vec![
                Stage::Idle,
                Stage::Authenticating,
                Stage::Building,
                Stage::Publishing,
                Stage::Connecting,
                Stage::TearingDown,
                Stage::Converging,
                Stage::Verifying,
                Stage::Done,
            ]
        );
        assert_eq!(run.running.len(), 4);
        assert_eq!(run.images["api"], "user/mean-api:latest");

        let containers = fixture.host.containers();
        assert_eq!(containers.len(), 4);
        for service in ["mongo", "api", "frontend", "proxy"] {
            let found = fixture.host.resolve_name("mean", service);
            assert!(found.is_some(), "{} not resolvable", service);
            assert_eq!(found.unwrap().name, format!("shop-{}-1", service));
        }
    }

    #[tokio::test]
    async fn test_auth_failure_stops_everything() {
        let fixture = Fixture::new();
        fixture.registry.fail_auth();
        let mut sequencer = fixture.sequencer(DeployPolicy::default());

        let run = sequencer.run(&push("d1")).await;

        assert_eq!(failure_kind(&run), Some(FailureKind::Authentication));
        assert!(fixture.registry.builds().is_empty());
        assert!(fixture.host.ops().is_empty());
    }

    #[tokio::test]
    async fn test_build_failure_publishes_nothing() {
        let fixture = Fixture::new();
        fixture.registry.fail_build("frontend");
        let mut sequencer = fixture.sequencer(DeployPolicy::default());

        let run = sequencer.run(&push("d1")).await;

        assert_eq!(run.stage, Stage::Failed);
        assert_eq!(failure_kind(&run), Some(FailureKind::Build));
        assert!(fixture.registry.publishes().is_empty());
        assert!(fixture.host.ops().is_empty());
        assert!(!run.stages().contains(&Stage::Publishing));
    }

    #[tokio::test]
    async fn test_publish_failure_never_connects() {
        let fixture = Fixture::new();
        fixture.registry.fail_publish("user/mean-frontend");
        let mut sequencer = fixture.sequencer(DeployPolicy::default());

        let run = sequencer.run(&push("d1")).await;

        assert_eq!(failure_kind(&run), Some(FailureKind::Publish));
        assert!(fixture.host.ops().is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_host_untouched() {
        let fixture = Fixture::new();
        let bystander = fixture.host.add_foreign_container("metrics", "prom/prometheus");
        fixture.host.set_unreachable(true);
        let mut sequencer = fixture.sequencer(DeployPolicy::default());

        let run = sequencer.run(&push("d1")).await;

        assert_eq!(failure_kind(&run), Some(FailureKind::Connection));
        assert!(fixture
            .host
            .ops()
            .iter()
            .all(|op| op.kind == HostOpKind::Connect));
        assert!(fixture.host.containers().iter().any(|c| c.id == bystander));
    }

    #[tokio::test]
    async fn test_failure_after_teardown_leaves_stack_down() {
        let fixture = Fixture::new();
        let mut sequencer = fixture.sequencer(DeployPolicy::default());
        assert!(sequencer.run(&push("d1")).await.succeeded());

        fixture.host.fail_on(HostOpKind::PullImages);
        let run = sequencer.run(&push("d2")).await;

        assert_eq!(failure_kind(&run), Some(FailureKind::RemoteCommand));
        assert!(run.stages().contains(&Stage::Converging));
        assert!(fixture.host.containers().is_empty());
        assert!(!run.ran("up"));
    }

    #[tokio::test]
    async fn test_rerun_replaces_every_container() {
        let fixture = Fixture::new();
        let mut sequencer = fixture.sequencer(DeployPolicy::default());

        assert!(sequencer.run(&push("d1")).await.succeeded());
        let first = stack_ids(&fixture.host);
        assert!(sequencer.run(&push("d2")).await.succeeded());
        let second = stack_ids(&fixture.host);

        assert_eq!(first.len(), 4);
        assert_eq!(second.len(), 4);
        assert!(first.is_disjoint(&second));
    }

    #[tokio::test]
    async fn test_host_wide_teardown_removes_foreign_workloads() {
        let fixture = Fixture::new();
        let bystander = fixture.host.add_foreign_container("metrics", "prom/prometheus");
        let mut sequencer = fixture.sequencer(DeployPolicy::default());

        assert!(sequencer.run(&push("d1")).await.succeeded());
        assert!(!fixture.host.containers().iter().any(|c| c.id == bystander));
    }

    #[tokio::test]
    async fn test_labeled_teardown_spares_foreign_workloads() {
        let fixture = Fixture::new();
        let bystander = fixture.host.add_foreign_container("metrics", "prom/prometheus");
        let policy = DeployPolicy {
            teardown: TeardownMode::Labeled,
            ..DeployPolicy::default()
        };
        let mut sequencer = fixture.sequencer(policy);

        assert!(sequencer.run(&push("d1")).await.succeeded());
        assert!(sequencer.run(&push("d2")).await.succeeded());

        let containers = fixture.host.containers();
        assert!(containers.iter().any(|c| c.id == bystander));
        assert_eq!(containers.len(), 5);
        assert!(containers
            .iter()
            .filter(|c| c.service.is_some())
            .all(|c| c.labels.get(STACK_LABEL).map(String::as_str) == Some("shop")));
    }

    #[tokio::test]
    async fn test_observational_verify_never_fails() {
        let fixture = Fixture::new();
        fixture.host.fail_on(HostOpKind::ListRunning);
        let mut sequencer = fixture.sequencer(DeployPolicy::default());

        let run = sequencer.run(&push("d1")).await;

        assert!(run.succeeded());
        assert!(run.running.is_empty());
    }

    #[tokio::test]
    async fn test_pinned_deploy_uses_published_digests() {
        let fixture = Fixture::new();
        let mut sequencer = fixture.sequencer(DeployPolicy::hardened());

        let run = sequencer.run(&push("d1")).await;
        assert!(run.succeeded(), "{:?}", run.outcome);

        let api = ImageRef::parse(&run.images["api"]).unwrap();
        assert!(!api.is_mutable());

        let written = fixture.host.manifest().unwrap();
        assert_eq!(
            written.services["api"].image.as_deref(),
            Some(run.images["api"].as_str())
        );
        assert!(written.services["api"].build.is_none());

        let container = fixture
            .host
            .containers()
            .into_iter()
            .find(|c| c.service.as_deref() == Some("api"))
            .unwrap();
        assert_eq!(container.digest, api.digest);

        // latest now follows the release
        let latest = ImageRef::parse("user/mean-api:latest").unwrap();
        assert_eq!(fixture.registry.resolve(&latest), api.digest);
        assert!(run.ran("lock"));
        assert!(fixture.host.lock_holder().is_none());
        assert_eq!(sequencer.history().latest().unwrap().run_id, run.id);
    }

    #[tokio::test]
    async fn test_gated_verify_fails_without_history() {
        let fixture = Fixture::new();
        fixture.host.set_unready("api");
        let policy = DeployPolicy {
            verify: VerifyMode::Gated {
                timeout_secs: 0,
                interval_secs: 0,
            },
            rollback: true,
            ..DeployPolicy::hardened()
        };
        let mut sequencer = fixture.sequencer(policy);

        let run = sequencer.run(&push("d1")).await;

        assert_eq!(failure_kind(&run), Some(FailureKind::Verification));
        assert!(matches!(run.outcome, Outcome::Failed { .. }));
        assert!(sequencer.history().latest().is_none());
        assert!(fixture.host.lock_holder().is_none());
    }

    #[tokio::test]
    async fn test_gated_verify_rolls_back_to_last_release() {
        let fixture = Fixture::new();
        let policy = DeployPolicy {
            verify: VerifyMode::Gated {
                timeout_secs: 0,
                interval_secs: 0,
            },
            ..DeployPolicy::hardened()
        };
        let mut sequencer = fixture.sequencer(policy);

        let good = sequencer.run(&push("d1")).await;
        assert!(good.succeeded());

        fixture.host.set_unready("api");
        let bad = sequencer.run(&push("d2")).await;

        match &bad.outcome {
            Outcome::RolledBack {
                kind, restored_run, ..
            } => {
                assert_eq!(*kind, FailureKind::Verification);
                assert_eq!(restored_run, &good.id);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(bad.stage, Stage::Failed);
        assert!(bad.ran("rollback:up"));

        let written = fixture.host.manifest().unwrap();
        assert_eq!(
            written.services["api"].image.as_deref(),
            Some(good.images["api"].as_str())
        );
        assert_eq!(sequencer.history().latest().unwrap().run_id, good.id);
    }

    #[tokio::test]
    async fn test_concurrent_runs_interleave_without_lock() {
        let fixture = Fixture::new();
        let mut a = fixture.sequencer(DeployPolicy::default());
        let mut b = fixture.sequencer(DeployPolicy::default());

        let (first, second) = (push("d1"), push("d2"));
        let (run_a, run_b) = tokio::join!(a.run(&first), b.run(&second));
        assert!(run_a.succeeded());
        assert!(run_b.succeeded());

        let sessions: Vec<u64> = fixture
            .host
            .ops()
            .iter()
            .filter(|op| op.kind != HostOpKind::Connect)
            .map(|op| op.session)
            .collect();
        let switches = sessions.windows(2).filter(|w| w[0] != w[1]).count();
        assert!(switches > 1, "host ops did not interleave: {:?}", sessions);
    }

    #[tokio::test]
    async fn test_lock_serializes_concurrent_runs() {
        let fixture = Fixture::new();
        let policy = DeployPolicy {
            lock: Some(LockPolicy {
                timeout_secs: 30,
                poll_interval_ms: 1,
            }),
            ..DeployPolicy::default()
        };
        let mut a = fixture.sequencer(policy.clone());
        let mut b = fixture.sequencer(policy);

        let (first, second) = (push("d1"), push("d2"));
        let (run_a, run_b) = tokio::join!(a.run(&first), b.run(&second));
        assert!(run_a.succeeded(), "{:?}", run_a.outcome);
        assert!(run_b.succeeded(), "{:?}", run_b.outcome);

        let sessions: Vec<u64> = fixture
            .host
            .ops()
            .iter()
            .filter(|op| {
                !matches!(
                    op.kind,
                    HostOpKind::Connect | HostOpKind::TryLock | HostOpKind::LockHolder
                )
            })
            .map(|op| op.session)
            .collect();
        let switches = sessions.windows(2).filter(|w| w[0] != w[1]).count();
        assert_eq!(switches, 1, "runs overlapped: {:?}", sessions);
        assert_eq!(fixture.host.containers().len(), 4);
        assert!(fixture.host.lock_holder().is_none());
    }

    #[tokio::test]
    async fn test_lock_timeout_fails_run() {
        let fixture = Fixture::new();
        let plan = fixture.plan(DeployPolicy::default());
        let other = fixture.host.connect(&plan.target).await.unwrap();
        assert!(other.try_lock("someone-else").await.unwrap());

        let policy = DeployPolicy {
            lock: Some(LockPolicy {
                timeout_secs: 0,
                poll_interval_ms: 1,
            }),
            ..DeployPolicy::default()
        };
        let mut sequencer = fixture.sequencer(policy);
        let run = sequencer.run(&push("d1")).await;

        assert_eq!(failure_kind(&run), Some(FailureKind::Lock));
        assert!(!fixture
            .host
            .ops()
            .iter()
            .any(|op| op.kind == HostOpKind::RemoveContainers));
        assert_eq!(fixture.host.lock_holder().as_deref(), Some("someone-else"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_stale_lock_from_exited_process_is_broken() {
        let fixture = Fixture::new();
        let plan = fixture.plan(DeployPolicy::default());
        let crashed = LockHolder {
            hostname: local_hostname(),
            pid: u32::MAX,
            run_id: "crashed-run".to_string(),
        };
        let other = fixture.host.connect(&plan.target).await.unwrap();
        assert!(other.try_lock(&crashed.to_string()).await.unwrap());

        let policy = DeployPolicy {
            lock: Some(LockPolicy {
                timeout_secs: 0,
                poll_interval_ms: 1,
            }),
            ..DeployPolicy::default()
        };
        let mut sequencer = fixture.sequencer(policy);
        let run = sequencer.run(&push("d1")).await;

        assert!(run.succeeded(), "{:?}", run.outcome);
        assert!(fixture.host.lock_holder().is_none());
    }

    #[tokio::test]
    async fn test_written_manifest_keeps_runtime_settings() {
        let fixture = Fixture::new();
        let mut sequencer = fixture.sequencer(DeployPolicy::hardened());
        let run = sequencer.run(&push("d1")).await;
        assert!(run.succeeded(), "{:?}", run.outcome);

        let written = fixture.host.manifest().unwrap();
        let api = &written.services["api"];
        assert!(api.build.is_none());
        assert_eq!(
            api.command,
            Some(crate::manifest::config::CommandConfig::Exec(vec![
                "node".to_string(),
                "server.js".to_string()
            ]))
        );
        assert_eq!(api.extra["deploy"]["resources"]["limits"]["memory"], "512m");
    }
}
