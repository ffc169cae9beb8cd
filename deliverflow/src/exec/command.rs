//! External tool invocation.

use crate::cancellation::CancellationToken;
use crate::errors::{DeliverError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;

/// A fully described process invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to execute.
    pub program: String,
    /// Arguments, passed verbatim.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Data written to the child's stdin, never logged.
    pub stdin: Option<String>,
}

impl CommandSpec {
    /// Creates a command for `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Runs `line` through `sh -c`.
    #[must_use]
    pub fn shell(line: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(line)
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Adds one environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Adds several environment variables.
    #[must_use]
    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Feeds `input` to the child's stdin.
    #[must_use]
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Returns true if the program and leading arguments match `prefix`.
    #[must_use]
    pub fn starts_with(&self, prefix: &[&str]) -> bool {
        let mut words = std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str));
        prefix.iter().all(|expected| words.next() == Some(*expected))
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg.replace('\'', r"'\''"))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `-1` when the process was terminated by a signal.
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl CommandOutput {
    /// A zero-exit output with the given stdout.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A non-zero output with the given stderr.
    #[must_use]
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns true if the process exited zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr.
    #[must_use]
    pub fn combined(&self) -> String {
        let mut text = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&self.stderr);
        }
        text
    }

    /// Last non-empty line of stderr, falling back to stdout.
    #[must_use]
    pub fn last_line(&self) -> Option<&str> {
        [self.stderr.as_str(), self.stdout.as_str()]
            .into_iter()
            .find_map(|text| text.lines().rev().map(str::trim).find(|l| !l.is_empty()))
    }
}

/// Executes external tools on behalf of stages.
///
/// A non-zero exit is not an error; callers classify it. Errors mean the
/// process could not be started or was cancelled.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `command` to completion, or until `cancel` fires.
    async fn run(&self, command: &CommandSpec, cancel: &CancellationToken) -> Result<CommandOutput>;
}

/// Runs commands as child processes of the orchestrator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    /// Creates a new process runner.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command: &CommandSpec, cancel: &CancellationToken) -> Result<CommandOutput> {
        if cancel.is_cancelled() {
            return Err(DeliverError::Cancelled(cancel.reason().unwrap_or_default()));
        }

        tracing::debug!(command = %command, "spawning");
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if command.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .kill_on_drop(true);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|source| DeliverError::Spawn {
            program: command.program.clone(),
            source,
        })?;

        if let (Some(input), Some(mut stdin)) = (&command.stdin, child.stdin.take()) {
            stdin.write_all(input.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        // Dropping the child on cancellation kills it.
        let output = tokio::select! {
            result = child.wait_with_output() => result?,
            () = cancel.cancelled() => {
                tracing::warn!(program = %command.program, "killing process on cancellation");
                return Err(DeliverError::Cancelled(cancel.reason().unwrap_or_default()));
            }
        };

        let result = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.stdout.trim().is_empty() {
            tracing::debug!(program = %command.program, "stdout: {}", result.stdout.trim());
        }
        if !result.stderr.trim().is_empty() {
            tracing::debug!(program = %command.program, "stderr: {}", result.stderr.trim());
        }
        tracing::debug!(program = %command.program, exit_code = result.exit_code, "process finished");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::{Duration, Instant};

    #[test]
    fn test_display_quotes_arguments() {
        let spec = CommandSpec::shell("echo hi").arg("x");
        assert_eq!(spec.to_string(), "sh -c 'echo hi' x");
    }

    #[test]
    fn test_starts_with() {
        let spec = CommandSpec::new("docker").args(["push", "reg/img:main"]);
        assert!(spec.starts_with(&["docker", "push"]));
        assert!(!spec.starts_with(&["docker", "build"]));
        assert!(!spec.starts_with(&["docker", "push", "reg/img:main", "extra"]));
    }

    #[test]
    fn test_output_helpers() {
        let out = CommandOutput {
            exit_code: 1,
            stdout: "line one\n".to_string(),
            stderr: "boom\n\n".to_string(),
        };
        assert!(!out.success());
        assert_eq!(out.last_line(), Some("boom"));
        assert_eq!(out.combined(), "line one\nboom\n\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_captures_output() {
        let token = CancellationToken::new();
        let out = ProcessRunner::new()
            .run(&CommandSpec::shell("echo out; echo err >&2; exit 3"), &token)
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_feeds_stdin() {
        let token = CancellationToken::new();
        let out = ProcessRunner::new()
            .run(&CommandSpec::new("cat").stdin("secret-token"), &token)
            .await
            .unwrap();
        assert_eq!(out.stdout, "secret-token");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_kills_on_cancel() {
        let token = std::sync::Arc::new(CancellationToken::new());
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel("user abort");
        });

        let started = Instant::now();
        let err = ProcessRunner::new()
            .run(&CommandSpec::new("sleep").arg("30"), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliverError::Cancelled(reason) if reason == "user abort"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let token = CancellationToken::new();
        let err = ProcessRunner::new()
            .run(&CommandSpec::new("definitely-not-a-real-binary-4f1c"), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliverError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_mock_runner() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .withf(|cmd, _| cmd.starts_with(&["colcon", "build"]))
            .times(1)
            .returning(|_, _| Ok(CommandOutput::ok("Summary: 3 packages finished")));

        let token = CancellationToken::new();
        let out = mock
            .run(&CommandSpec::new("colcon").arg("build"), &token)
            .await
            .unwrap();
        assert!(out.success());
    }
}
