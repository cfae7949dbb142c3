//! Remote host over the system ssh client
//!
//! Each session operation is one shell command executed on the host. The
//! host needs docker with the compose plugin; nothing else is installed.

use super::command::{shell_quote, CommandError, CommandOutput, CommandRunner};
use super::{
    Connector, HostSession, HostTarget, RunningContainer, TeardownScope, COMPOSE_SERVICE_LABEL,
};
use crate::error::{Result, RolloutError};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// File name of the manifest inside the host workdir
pub const REMOTE_MANIFEST: &str = "compose.yaml";
/// Lock directory inside the host workdir
pub const REMOTE_LOCK_DIR: &str = ".rollout.lock";
/// Exit code ssh reserves for its own failures
const SSH_ERROR_CODE: i32 = 255;

/// Opens [`SshSession`]s
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    runner: CommandRunner,
}

impl SshConnector {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }
}

impl Connector for SshConnector {
    type Session = SshSession;

    async fn connect(&self, target: &HostTarget) -> Result<SshSession> {
        info!("Connecting to {}:{}", target.destination(), target.port);

        let session = SshSession {
            target: target.clone(),
            runner: self.runner.clone(),
        };

        let output = session
            .exec_raw("true", None)
            .await
            .map_err(|e| RolloutError::Connection(e.to_string()))?;
        if !output.success() {
            return Err(RolloutError::Connection(format!(
                "{} unreachable: {}",
                target.destination(),
                output.stderr.trim()
            )));
        }

        Ok(session)
    }
}

/// Shell session on the deployment host
#[derive(Debug, Clone)]
pub struct SshSession {
    target: HostTarget,
    runner: CommandRunner,
}

impl SshSession {
    /// ssh arguments for running `command` remotely
    pub fn ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-p".to_string(),
            self.target.port.to_string(),
        ];
        if let Some(ref key) = self.target.identity_file {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push(self.target.destination());
        args.push("--".to_string());
        args.push(command.to_string());
        args
    }

    fn workdir(&self) -> String {
        shell_quote(&self.target.workdir)
    }

    fn compose(&self, subcommand: &str) -> String {
        format!(
            "cd {} && docker compose -f {} {}",
            self.workdir(),
            REMOTE_MANIFEST,
            subcommand
        )
    }

    fn lock_dir(&self) -> String {
        format!("{}/{}", self.workdir(), REMOTE_LOCK_DIR)
    }

    async fn exec_raw(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> std::result::Result<CommandOutput, CommandError> {
        debug!("[{}] {}", self.target.address, command);
        self.runner.run("ssh", &self.ssh_args(command), stdin).await
    }

    /// Run a command that must succeed
    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<String> {
        let output = self.exec_raw(command, stdin).await.map_err(|e| match e {
            CommandError::Timeout { .. } => RolloutError::Timeout(e.to_string()),
            other => RolloutError::Connection(other.to_string()),
        })?;

        match output.code {
            0 => Ok(output.stdout),
            SSH_ERROR_CODE => Err(RolloutError::Connection(output.stderr.trim().to_string())),
            code => Err(RolloutError::RemoteCommand {
                command: command.to_string(),
                code,
                stderr: output.stderr.trim().to_string(),
            }),
        }
    }

    /// Run a command whose exit status is the answer
    async fn probe(&self, command: &str) -> Result<(bool, String)> {
        let output = self.exec_raw(command, None).await.map_err(|e| match e {
            CommandError::Timeout { .. } => RolloutError::Timeout(e.to_string()),
            other => RolloutError::Connection(other.to_string()),
        })?;
        if output.code == SSH_ERROR_CODE {
            return Err(RolloutError::Connection(output.stderr.trim().to_string()));
        }
        Ok((output.success(), output.stdout))
    }
}

/// Shell command removing the containers in scope
pub fn remove_command(scope: &TeardownScope) -> String {
    match scope {
        TeardownScope::HostWide => "docker ps -aq | xargs -r docker rm -f".to_string(),
        TeardownScope::Labeled { key, value } => format!(
            "docker ps -aq --filter {} | xargs -r docker rm -f",
            shell_quote(&format!("label={}={}", key, value))
        ),
    }
}

/// Shell command pruning images
pub fn prune_command(scope: &TeardownScope) -> String {
    match scope {
        TeardownScope::HostWide => "docker system prune -af".to_string(),
        TeardownScope::Labeled { key, value } => format!(
            "docker image prune -af --filter {}",
            shell_quote(&format!("label={}={}", key, value))
        ),
    }
}

impl HostSession for SshSession {
    async fn remove_containers(&self, scope: &TeardownScope) -> Result<usize> {
        let count_cmd = match scope {
            TeardownScope::HostWide => "docker ps -aq | wc -l".to_string(),
            TeardownScope::Labeled { key, value } => format!(
                "docker ps -aq --filter {} | wc -l",
                shell_quote(&format!("label={}={}", key, value))
            ),
        };
        let stdout = self.exec(&count_cmd, None).await?;
        let count = parse_count(&stdout).unwrap_or_else(|| {
            warn!("Unexpected container count from host: '{}'", stdout.trim());
            0
        });

        info!("Removing {} container(s) ({})", count, scope);
        self.exec(&remove_command(scope), None).await?;
        Ok(count)
    }

    async fn prune_images(&self, scope: &TeardownScope) -> Result<()> {
        self.exec(&prune_command(scope), None).await?;
        Ok(())
    }

    async fn write_manifest(&self, yaml: &str) -> Result<()> {
        let command = format!(
            "mkdir -p {dir} && cat > {dir}/{file}",
            dir = self.workdir(),
            file = REMOTE_MANIFEST
        );
        self.exec(&command, Some(yaml.as_bytes())).await?;
        Ok(())
    }

    async fn pull_images(&self) -> Result<()> {
        self.exec(&self.compose("pull"), None).await?;
        Ok(())
    }

    async fn up(&self) -> Result<()> {
        self.exec(&self.compose("up -d --remove-orphans"), None).await?;
        Ok(())
    }

    async fn list_running(&self) -> Result<Vec<RunningContainer>> {
        let stdout = self
            .exec("docker ps --format '{{json .}}'", None)
            .await?;
        parse_ps_lines(&stdout)
    }

    async fn service_ready(&self, service: &str) -> Result<bool> {
        let inspect = "docker inspect --format \
            '{{if .State.Health}}{{.State.Health.Status}}{{else}}{{.State.Status}}{{end}}'";
        let command = format!(
            "cd {} && id=$(docker compose -f {} ps -q {}) && [ -n \"$id\" ] && {} \"$id\"",
            self.workdir(),
            REMOTE_MANIFEST,
            shell_quote(service),
            inspect
        );
        let (ok, stdout) = self.probe(&command).await?;
        Ok(ok && is_ready_state(stdout.trim()))
    }

    async fn try_lock(&self, holder: &str) -> Result<bool> {
        let command = format!(
            "mkdir -p {} && mkdir {lock} 2>/dev/null && echo {} > {lock}/holder",
            self.workdir(),
            shell_quote(holder),
            lock = self.lock_dir()
        );
        let (acquired, _) = self.probe(&command).await?;
        Ok(acquired)
    }

    async fn unlock(&self, holder: &str) -> Result<()> {
        let command = format!(
            "if [ \"$(cat {lock}/holder 2>/dev/null)\" = {} ]; then rm -rf {lock}; fi",
            shell_quote(holder),
            lock = self.lock_dir()
        );
        self.exec(&command, None).await?;
        Ok(())
    }

    async fn lock_holder(&self) -> Result<Option<String>> {
        let command = format!("cat {}/holder 2>/dev/null", self.lock_dir());
        let (present, stdout) = self.probe(&command).await?;
        let holder = stdout.trim();
        Ok((present && !holder.is_empty()).then(|| holder.to_string()))
    }
}

/// Parse the output of `wc -l`
fn parse_count(stdout: &str) -> Option<usize> {
    stdout.trim().parse().ok()
}

/// `docker ps --format '{{json .}}'` line
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    names: String,
    image: String,
    #[serde(default)]
    labels: String,
    #[serde(default)]
    networks: String,
}

/// Parse `docker ps` JSON lines
pub fn parse_ps_lines(stdout: &str) -> Result<Vec<RunningContainer>> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let ps: PsLine = serde_json::from_str(line)?;
            let labels: BTreeMap<String, String> = ps
                .labels
                .split(',')
                .filter_map(|pair| pair.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            let networks = ps
                .networks
                .split(',')
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect();

            Ok(RunningContainer {
                id: ps.id,
                name: ps.names,
                image: ps.image,
                service: labels.get(COMPOSE_SERVICE_LABEL).cloned(),
                networks,
                labels,
            })
        })
        .collect()
}

fn is_ready_state(state: &str) -> bool {
    matches!(state, "healthy" | "running")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn session() -> SshSession {
        SshSession {
            target: HostTarget {
                address: "203.0.113.7".to_string(),
                user: "deploy".to_string(),
                port: 2222,
                identity_file: Some(PathBuf::from("/run/secrets/deploy_key")),
                workdir: "app".to_string(),
            },
            runner: CommandRunner::default(),
        }
    }

    #[test]
    fn test_ssh_args() {
        let args = session().ssh_args("docker ps");
        assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "2222"));
        assert!(args
            .windows(2)
            .any(|w| w[0] == "-i" && w[1] == "/run/secrets/deploy_key"));
        assert_eq!(args[args.len() - 3], "deploy@203.0.113.7");
        assert_eq!(args.last().unwrap(), "docker ps");
    }

    #[test]
    fn test_teardown_commands() {
        assert_eq!(
            remove_command(&TeardownScope::HostWide),
            "docker ps -aq | xargs -r docker rm -f"
        );
        assert_eq!(
            remove_command(&TeardownScope::for_stack("shop")),
            "docker ps -aq --filter label=com.rollout.project=shop | xargs -r docker rm -f"
        );
        assert_eq!(prune_command(&TeardownScope::HostWide), "docker system prune -af");
        assert!(prune_command(&TeardownScope::for_stack("shop")).starts_with("docker image prune"));
    }

    #[test]
    fn test_compose_command() {
        assert_eq!(
            session().compose("pull"),
            "cd app && docker compose -f compose.yaml pull"
        );
    }

    #[test]
    fn test_parse_ps_lines() {
        let stdout = concat!(
            r#"{"ID":"a1b2c3","Image":"user/mean-api:latest","Names":"shop-api-1","Labels":"com.docker.compose.project=shop,com.docker.compose.service=api","Networks":"shop_app","State":"running"}"#,
            "\n",
            r#"{"ID":"d4e5f6","Image":"redis","Names":"cache","Labels":"","Networks":"bridge"}"#,
            "\n\n"
        );

        let containers = parse_ps_lines(stdout).unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].service.as_deref(), Some("api"));
        assert_eq!(containers[0].networks, vec!["shop_app"]);
        assert_eq!(containers[1].service, None);
        assert!(containers[1].labels.is_empty());

        assert!(parse_ps_lines("not json").is_err());
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count("3\n"), Some(3));
        assert_eq!(parse_count("  0 "), Some(0));
        assert_eq!(parse_count("Cannot connect to the Docker daemon\n0"), None);
        assert_eq!(parse_count(""), None);
    }

    #[test]
    fn test_ready_states() {
        assert!(is_ready_state("healthy"));
        assert!(is_ready_state("running"));
        assert!(!is_ready_state("starting"));
        assert!(!is_ready_state("exited"));
    }
}
