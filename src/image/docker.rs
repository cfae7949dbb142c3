//! Local docker CLI as image builder and registry client

use super::{BuildSpec, Digest, ImageRef};
use crate::error::{Result, RolloutError};
use crate::host::command::{CommandOutput, CommandRunner};
use crate::pipeline::steps::{ImageBuilder, Registry, RegistryCredentials};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::info;

/// Lines of stderr kept in error messages
const STDERR_TAIL: usize = 5;

/// Drives `docker build`, `docker login` and `docker push`
#[derive(Debug, Clone, Default)]
pub struct DockerCli {
    runner: CommandRunner,
    labels: BTreeMap<String, String>,
}

impl DockerCli {
    pub fn new(runner: CommandRunner) -> Self {
        Self {
            runner,
            labels: BTreeMap::new(),
        }
    }

    /// Label every built image
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Arguments for `docker build`
    pub fn build_args(&self, spec: &BuildSpec) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            "-t".to_string(),
            spec.image.to_string(),
            "-f".to_string(),
            spec.dockerfile_path().display().to_string(),
        ];
        for (key, value) in &self.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(spec.context.display().to_string());
        args
    }

    async fn docker(&self, args: Vec<String>, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        self.runner
            .run("docker", &args, stdin)
            .await
            .map_err(|e| RolloutError::Internal(e.to_string()))
    }

    async fn digest_of(&self, image: &ImageRef) -> Result<Option<Digest>> {
        let output = self
            .docker(
                vec![
                    "image".to_string(),
                    "inspect".to_string(),
                    "--format".to_string(),
                    "{{json .RepoDigests}}".to_string(),
                    image.to_string(),
                ],
                None,
            )
            .await?;
        if !output.success() {
            return Ok(None);
        }
        let digests: Vec<String> = serde_json::from_str(output.stdout.trim())?;
        Ok(repo_digest(&digests, &image.name()))
    }
}

fn tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.trim().lines().collect();
    lines[lines.len().saturating_sub(STDERR_TAIL)..].join("\n")
}

fn push_digest_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"digest: (sha256:[0-9a-f]{64})").expect("static pattern is valid"))
}

/// Digest reported by `docker push`
pub fn parse_push_digest(stdout: &str) -> Option<Digest> {
    push_digest_pattern()
        .captures(stdout)
        .and_then(|caps| Digest::parse(&caps[1]).ok())
}

/// Digest of `name` among an image's `RepoDigests`
pub fn repo_digest(repo_digests: &[String], name: &str) -> Option<Digest> {
    repo_digests
        .iter()
        .filter_map(|entry| entry.split_once('@'))
        .find(|(repo, _)| *repo == name)
        .and_then(|(_, digest)| Digest::parse(digest).ok())
}

impl ImageBuilder for DockerCli {
    async fn build(&self, spec: &BuildSpec) -> Result<()> {
        info!("Building {} from {}", spec.image, spec.context.display());
        let output = self
            .docker(self.build_args(spec), None)
            .await
            .map_err(|e| RolloutError::Build {
                service: spec.service.clone(),
                message: e.to_string(),
            })?;

        if !output.success() {
            return Err(RolloutError::Build {
                service: spec.service.clone(),
                message: tail(&output.stderr),
            });
        }
        Ok(())
    }
}

impl Registry for DockerCli {
    async fn authenticate(&self, credentials: &RegistryCredentials) -> Result<()> {
        if !credentials.is_complete() {
            return Err(RolloutError::Authentication(
                "registry username and token are required".to_string(),
            ));
        }

        let mut args = vec!["login".to_string()];
        if let Some(ref registry) = credentials.registry {
            args.push(registry.clone());
        }
        args.extend([
            "--username".to_string(),
            credentials.username.clone(),
            "--password-stdin".to_string(),
        ]);

        let output = self
            .docker(args, Some(credentials.token.as_bytes()))
            .await
            .map_err(|e| RolloutError::Authentication(e.to_string()))?;
        if !output.success() {
            return Err(RolloutError::Authentication(tail(&output.stderr)));
        }
        Ok(())
    }

    async fn publish(&self, image: &ImageRef) -> Result<Digest> {
        info!("Pushing {}", image);
        let fail = |message: String| RolloutError::Publish {
            image: image.to_string(),
            message,
        };

        let output = self
            .docker(vec!["push".to_string(), image.to_string()], None)
            .await
            .map_err(|e| fail(e.to_string()))?;
        if !output.success() {
            return Err(fail(tail(&output.stderr)));
        }

        if let Some(digest) = parse_push_digest(&output.stdout) {
            return Ok(digest);
        }
        self.digest_of(image)
            .await?
            .ok_or_else(|| fail("registry did not report a digest".to_string()))
    }

    async fn alias(&self, source: &ImageRef, alias: &ImageRef) -> Result<()> {
        let fail = |message: String| RolloutError::Publish {
            image: alias.to_string(),
            message,
        };

        let output = self
            .docker(
                vec!["tag".to_string(), source.to_string(), alias.to_string()],
                None,
            )
            .await?;
        if !output.success() {
            return Err(fail(tail(&output.stderr)));
        }

        let output = self
            .docker(vec!["push".to_string(), alias.to_string()], None)
            .await?;
        if !output.success() {
            return Err(fail(tail(&output.stderr)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn test_build_args() {
        let spec = BuildSpec::new(
            "api",
            "backend",
            ImageRef::parse("user/mean-api:latest").unwrap(),
        );
        let cli = DockerCli::default().label("com.rollout.project", "shop");
        let args = cli.build_args(&spec);

        assert_eq!(
            args,
            vec![
                "build",
                "-t",
                "user/mean-api:latest",
                "-f",
                "backend/Dockerfile",
                "--label",
                "com.rollout.project=shop",
                "backend",
            ]
        );
    }

    #[test]
    fn test_parse_push_digest() {
        let stdout = format!(
            "The push refers to repository [docker.io/user/mean-api]\nlatest: digest: sha256:{} size: 1570\n",
            HEX
        );
        assert_eq!(parse_push_digest(&stdout).unwrap().hex(), HEX);
        assert!(parse_push_digest("Layer already exists").is_none());
    }

    #[test]
    fn test_repo_digest() {
        let digests = vec![
            format!("other/repo@sha256:{}", "0".repeat(64)),
            format!("user/mean-api@sha256:{}", HEX),
        ];
        assert_eq!(repo_digest(&digests, "user/mean-api").unwrap().hex(), HEX);
        assert!(repo_digest(&digests, "user/mean-frontend").is_none());
    }

    #[test]
    fn test_tail_keeps_last_lines() {
        let stderr = (1..=8).map(|i| format!("line {}", i)).collect::<Vec<_>>().join("\n");
        assert_eq!(tail(&stderr), "line 4\nline 5\nline 6\nline 7\nline 8");
    }
}
