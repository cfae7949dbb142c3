//! Local process execution
//!
//! Every docker and ssh invocation goes through [`CommandRunner`]: output
//! lines are streamed to the log as they arrive and collected for the
//! caller, and an optional timeout kills a hung process.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error};

/// Command execution errors
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("IO error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Captured result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code (-1 when killed by a signal)
    pub code: i32,
    /// Collected stdout
    pub stdout: String,
    /// Collected stderr
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Command runner
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    timeout: Option<Duration>,
    work_dir: Option<PathBuf>,
}

impl CommandRunner {
    /// Create a runner; `None` waits indefinitely
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            work_dir: None,
        }
    }

    /// Run commands from the given directory
    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run a program, optionally feeding `stdin`
    pub async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, CommandError> {
        debug!(">>> {} {}", program, args.join(" "));

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.work_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| CommandError::SpawnFailed {
            program: program.to_string(),
            source,
        })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input)
                .await
                .map_err(|source| CommandError::Io {
                    program: program.to_string(),
                    source,
                })?;
            // closing stdin lets `cat > file` style commands finish
            drop(pipe);
        }

        let stdout_task = child.stdout.take().map(|out| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                let mut collected = String::new();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("  | {}", line);
                    collected.push_str(&line);
                    collected.push('\n');
                }
                collected
            })
        });
        let stderr_task = child.stderr.take().map(|err| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                let mut collected = String::new();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("  ! {}", line);
                    collected.push_str(&line);
                    collected.push('\n');
                }
                collected
            })
        });

        let status = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    error!("{} timed out after {:?}", program, limit);
                    let _ = child.kill().await;
                    return Err(CommandError::Timeout {
                        program: program.to_string(),
                        timeout: limit,
                    });
                }
            },
            None => child.wait().await,
        }
        .map_err(|source| CommandError::Io {
            program: program.to_string(),
            source,
        })?;

        let stdout = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        Ok(CommandOutput {
            code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }
}

/// Quote a string for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_run_success() {
        let runner = CommandRunner::new(Some(Duration::from_secs(5)));
        let output = runner.run("echo", &args(&["hello"]), None).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "hello\n");
    }

    #[tokio::test]
    async fn test_run_with_stdin() {
        let runner = CommandRunner::new(None);
        let output = runner
            .run("cat", &[], Some(b"services: {}\n"))
            .await
            .unwrap();
        assert_eq!(output.stdout, "services: {}\n");
    }

    #[tokio::test]
    async fn test_run_exit_code_and_stderr() {
        let runner = CommandRunner::new(None);
        let output = runner
            .run("sh", &args(&["-c", "echo oops >&2; exit 3"]), None)
            .await
            .unwrap();
        assert_eq!(output.code, 3);
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_run_not_found() {
        let runner = CommandRunner::new(None);
        let result = runner.run("nonexistent_command_12345", &[], None).await;
        assert!(matches!(result, Err(CommandError::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let runner = CommandRunner::new(Some(Duration::from_millis(100)));
        let result = runner.run("sleep", &args(&["5"]), None).await;
        assert!(matches!(result, Err(CommandError::Timeout { .. })));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("compose.yaml"), "compose.yaml");
        assert_eq!(shell_quote("label=com.rollout.project=shop"), "label=com.rollout.project=shop");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
