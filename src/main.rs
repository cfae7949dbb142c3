//! rollout - deployment pipeline and edge proxy for a single-host stack
//!
//! This is the main CLI entry point for rollout.

use clap::{Parser, Subcommand};
use rollout::config::RolloutConfig;
use rollout::error::Result;
use rollout::host::{CommandRunner, SimulatedHost, SimulatedRegistry, SshConnector, STACK_LABEL};
use rollout::image::{Digest, DockerCli, ImageRef};
use rollout::manifest::ManifestParser;
use rollout::pipeline::{
    abbreviate, DeployPolicy, DeploymentPlan, DeploymentSequencer, Dispatch, Outcome, PipelineRun,
    PushEvent, ReleaseHistory, TriggerFilter, TriggerLedger,
};
use rollout::proxy::EdgeProxy;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// rollout - deploy a containerised stack to one host
#[derive(Parser)]
#[command(name = "rollout")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Build, publish and converge a containerised web stack on a single host", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Config file (default: ./rollout.yaml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the deployment pipeline
    Deploy {
        /// Commit being deployed (default: git HEAD)
        #[arg(long)]
        commit: Option<String>,
        /// Branch being deployed (default: configured branch)
        #[arg(long)]
        branch: Option<String>,
        /// Run against an in-memory registry and host
        #[arg(long)]
        dry_run: bool,
        /// Enable every safeguard
        #[arg(long)]
        hardened: bool,
        /// Print the run record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the pipeline for a push webhook payload
    Trigger {
        /// Webhook JSON body
        #[arg(short, long)]
        event: PathBuf,
        /// Delivery identifier (default: hash of the payload)
        #[arg(long)]
        delivery_id: Option<String>,
        /// Run against an in-memory registry and host
        #[arg(long)]
        dry_run: bool,
        /// Enable every safeguard
        #[arg(long)]
        hardened: bool,
        /// Print the run record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the edge proxy
    Proxy {
        /// Listen address (default: from config)
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Inspect the manifest
    Manifest {
        #[command(subcommand)]
        command: ManifestCommands,
    },

    /// Inspect proxy routes
    Routes {
        #[command(subcommand)]
        command: RoutesCommands,
    },

    /// Show recorded releases
    History,
}

#[derive(Subcommand)]
enum ManifestCommands {
    /// Validate the manifest
    Validate {
        /// Manifest file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Print the service start order
    Order {
        /// Manifest file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum RoutesCommands {
    /// Show where a request path is forwarded
    Resolve {
        /// Path and query, e.g. /api/widgets?page=2
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let working_dir = std::env::current_dir()?;
    let config = RolloutConfig::discover(cli.config.as_deref(), &working_dir)?;
    let env: HashMap<String, String> = std::env::vars().collect();

    match cli.command {
        Commands::Deploy {
            commit,
            branch,
            dry_run,
            hardened,
            json,
        } => {
            let commit = match commit {
                Some(commit) => commit,
                None => head_commit(&config.base_dir).await,
            };
            let branch = branch.unwrap_or_else(|| config.branch.clone());
            let event = PushEvent::new(
                &Uuid::new_v4().to_string(),
                &format!("refs/heads/{}", branch),
                &commit,
            );

            let plan = config.plan(&env, policy(&config, hardened), dry_run)?;
            let run = execute(&config, plan, &event, dry_run).await?;
            finish(&config, &run, dry_run, json)?;
        }

        Commands::Trigger {
            event,
            delivery_id,
            dry_run,
            hardened,
            json,
        } => {
            let body = std::fs::read_to_string(&event)?;
            let delivery_id = delivery_id
                .unwrap_or_else(|| Digest::of_bytes(body.as_bytes()).hex()[..16].to_string());
            let event = PushEvent::from_webhook(&delivery_id, &body)?;

            let mut ledger = if dry_run {
                TriggerLedger::in_memory()
            } else {
                TriggerLedger::open(&config.ledger_path())?
            };
            match ledger.dispatch(&TriggerFilter::new(&config.branch), &event)? {
                Dispatch::Ignored => {
                    println!(
                        "Ignoring push to {} (deploying from {})",
                        event.git_ref, config.branch
                    );
                }
                Dispatch::Duplicate => {
                    println!("Delivery {} was already handled", event.delivery_id);
                }
                Dispatch::Run => {
                    if let Some(ref pusher) = event.pusher {
                        info!("Push by {} to {}", pusher, event.git_ref);
                    }
                    let plan = config.plan(&env, policy(&config, hardened), dry_run)?;
                    let run = execute(&config, plan, &event, dry_run).await?;
                    finish(&config, &run, dry_run, json)?;
                }
            }
        }

        Commands::Proxy { listen } => {
            let listen = listen.unwrap_or_else(|| config.proxy.listen.clone());
            let proxy = EdgeProxy::new(config.proxy.routes.clone())?
                .with_read_timeout(Duration::from_secs(config.proxy.read_timeout_secs));
            proxy.run(&listen).await?;
        }

        Commands::Manifest { command } => match command {
            ManifestCommands::Validate { file } => {
                let path = manifest_file(&config, file)?;
                let manifest = ManifestParser::parse_file(&path)?;
                let warnings = ManifestParser::validate(&manifest)?;
                for warning in &warnings {
                    println!("warning: {}", warning);
                }
                println!(
                    "{} is valid ({} services, {} warnings)",
                    path.display(),
                    manifest.services.len(),
                    warnings.len()
                );
            }
            ManifestCommands::Order { file } => {
                let manifest = ManifestParser::parse_file(&manifest_file(&config, file)?)?;
                for (i, service) in manifest.start_order()?.iter().enumerate() {
                    println!(
                        "{:>2}. {:<16} {}",
                        i + 1,
                        service,
                        manifest.networks_of(service)?.join(",")
                    );
                }
            }
        },

        Commands::Routes { command } => match command {
            RoutesCommands::Resolve { path } => {
                let table = &config.proxy.routes;
                if let Some(location) = table.redirect_for(&path) {
                    println!("301 -> {}", location);
                } else if let Some(route) = table.resolve(&path) {
                    println!("{} -> {}", path, route.url());
                } else {
                    println!("{} -> 404 (no route)", path);
                }
            }
        },

        Commands::History => {
            let history = ReleaseHistory::load(&config.history_path())?;
            if history.releases().is_empty() {
                println!("No releases recorded");
            }
            for release in history.releases().iter().rev() {
                println!(
                    "{:<10} {:<12} {}",
                    abbreviate(&release.run_id, 8),
                    abbreviate(&release.commit, 12),
                    release.finished_at.format("%Y-%m-%d %H:%M:%S")
                );
                for (service, image) in &release.images {
                    println!("    {:<12} {}", service, image);
                }
            }
        }
    }

    Ok(())
}

fn policy(config: &RolloutConfig, hardened: bool) -> DeployPolicy {
    if hardened {
        DeployPolicy::hardened()
    } else {
        config.policy.clone()
    }
}

fn manifest_file(config: &RolloutConfig, file: Option<PathBuf>) -> Result<PathBuf> {
    match file {
        Some(file) => Ok(file),
        None => config.manifest_path(),
    }
}

async fn head_commit(dir: &Path) -> String {
    let runner = CommandRunner::new(None).work_dir(dir);
    let args = ["rev-parse".to_string(), "HEAD".to_string()];
    match runner.run("git", &args, None).await {
        Ok(output) if output.success() => output.stdout.trim().to_string(),
        _ => "unknown".to_string(),
    }
}

/// Run the pipeline against the real host, or the simulated one
async fn execute(
    config: &RolloutConfig,
    plan: DeploymentPlan,
    event: &PushEvent,
    dry_run: bool,
) -> Result<PipelineRun> {
    if dry_run {
        let registry = SimulatedRegistry::new();
        for (service, declared) in &plan.manifest.services {
            if plan.builds.iter().any(|b| &b.service == service) {
                continue;
            }
            if let Some(ref image) = declared.image {
                registry.seed(&ImageRef::parse(image)?);
            }
        }
        let host = SimulatedHost::new(registry.clone());
        let mut sequencer = DeploymentSequencer::new(registry.clone(), registry, host, plan);
        return Ok(sequencer.run(event).await);
    }

    let runner = CommandRunner::new(config.command_timeout()).work_dir(&config.base_dir);
    let docker = DockerCli::new(runner.clone()).label(STACK_LABEL, &plan.project);
    let history = ReleaseHistory::load(&config.history_path())?;
    let mut sequencer =
        DeploymentSequencer::new(docker.clone(), docker, SshConnector::new(runner), plan)
            .with_history(history);
    Ok(sequencer.run(event).await)
}

/// Report the run and set the exit status
fn finish(config: &RolloutConfig, run: &PipelineRun, dry_run: bool, json: bool) -> Result<()> {
    if !dry_run {
        let dir = config.runs_dir();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.json", run.id));
        std::fs::write(&path, serde_json::to_string_pretty(run)?)?;
        info!("Run record written to {}", path.display());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(run)?);
    } else {
        print_run(run);
    }

    if !run.succeeded() {
        warn!("Run {} did not succeed", run.short_id());
        std::process::exit(1);
    }
    Ok(())
}

fn print_run(run: &PipelineRun) {
    println!(
        "Run {} for {} ({})",
        run.short_id(),
        abbreviate(&run.commit, 12),
        run.branch
    );
    println!("{:<24} {:<14} {:<8} {:>8}", "STEP", "STAGE", "STATUS", "MS");
    for step in &run.steps {
        println!(
            "{:<24} {:<14} {:<8} {:>8}",
            step.name,
            step.stage.to_string(),
            format!("{:?}", step.status).to_lowercase(),
            step.duration_ms.unwrap_or_default()
        );
    }

    if !run.images.is_empty() {
        println!();
        for (service, image) in &run.images {
            println!("{:<12} {}", service, image);
        }
    }
    if !run.running.is_empty() {
        println!();
        println!("{:<14} {:<24} {:<40}", "CONTAINER ID", "NAME", "IMAGE");
        for container in &run.running {
            println!(
                "{:<14} {:<24} {:<40}",
                abbreviate(&container.id, 12),
                container.name,
                container.image
            );
        }
    }

    println!();
    match &run.outcome {
        Outcome::Succeeded => println!("Deployment succeeded"),
        Outcome::Failed { kind, message } => println!("Deployment failed ({}): {}", kind, message),
        Outcome::RolledBack {
            kind,
            message,
            restored_run,
        } => println!(
            "Deployment failed ({}): {}; rolled back to {}",
            kind, message, restored_run
        ),
        Outcome::Pending => println!("Deployment did not finish"),
    }
}
