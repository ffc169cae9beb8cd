//! Scripted command runner and mock stages for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::context::StageContext;
use crate::core::{StageKind, StageOutput};
use crate::errors::{DeliverError, Result};
use crate::exec::{CommandOutput, CommandRunner, CommandSpec};
use crate::stages::{failure_for, Stage};

type Matcher = Box<dyn Fn(&CommandSpec) -> bool + Send + Sync>;
type Responder = Box<dyn Fn(&CommandSpec) -> Result<CommandOutput> + Send + Sync>;

enum Reply {
    Respond(Responder),
    /// Block until the run is cancelled.
    Hang,
}

struct Rule {
    label: String,
    matcher: Matcher,
    reply: Reply,
}

/// A [`CommandRunner`] that answers from rules instead of spawning processes.
///
/// Rules are tried in the order they were added; the first match answers.
/// Unmatched commands succeed with empty output. Every invocation is
/// recorded.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Vec<Rule>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    /// Creates a runner where every command succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers commands starting with `prefix` with `output`.
    #[must_use]
    pub fn on(self, prefix: &[&str], output: CommandOutput) -> Self {
        self.on_with(prefix, move |_| Ok(output.clone()))
    }

    /// Answers commands starting with `prefix` by calling `respond`.
    ///
    /// The closure may touch the filesystem to stand in for the tool's side
    /// effects.
    #[must_use]
    pub fn on_with<F>(self, prefix: &[&str], respond: F) -> Self
    where
        F: Fn(&CommandSpec) -> Result<CommandOutput> + Send + Sync + 'static,
    {
        let words: Vec<String> = prefix.iter().map(ToString::to_string).collect();
        self.when(prefix.join(" "), move |cmd| starts_with(cmd, &words), respond)
    }

    /// Fails commands starting with `prefix` with `exit_code` and `stderr`.
    #[must_use]
    pub fn fail_on(self, prefix: &[&str], exit_code: i32, stderr: &str) -> Self {
        self.on(prefix, CommandOutput::failed(exit_code, stderr))
    }

    /// Blocks commands starting with `prefix` until the run is cancelled.
    #[must_use]
    pub fn hang_on(mut self, prefix: &[&str]) -> Self {
        let words: Vec<String> = prefix.iter().map(ToString::to_string).collect();
        self.rules.push(Rule {
            label: prefix.join(" "),
            matcher: Box::new(move |cmd| starts_with(cmd, &words)),
            reply: Reply::Hang,
        });
        self
    }

    /// Adds a rule with an arbitrary matcher.
    #[must_use]
    pub fn when<M, F>(mut self, label: impl Into<String>, matcher: M, respond: F) -> Self
    where
        M: Fn(&CommandSpec) -> bool + Send + Sync + 'static,
        F: Fn(&CommandSpec) -> Result<CommandOutput> + Send + Sync + 'static,
    {
        self.rules.push(Rule {
            label: label.into(),
            matcher: Box::new(matcher),
            reply: Reply::Respond(Box::new(respond)),
        });
        self
    }

    /// Every command run so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().clone()
    }

    /// The rendered command lines run so far.
    #[must_use]
    pub fn command_lines(&self) -> Vec<String> {
        self.calls.lock().iter().map(ToString::to_string).collect()
    }

    /// Number of commands starting with `prefix`.
    #[must_use]
    pub fn count(&self, prefix: &[&str]) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Returns true if a command starting with `prefix` was run.
    #[must_use]
    pub fn was_called(&self, prefix: &[&str]) -> bool {
        self.count(prefix) > 0
    }
}

fn starts_with(cmd: &CommandSpec, words: &[String]) -> bool {
    let words: Vec<&str> = words.iter().map(String::as_str).collect();
    cmd.starts_with(&words)
}

impl fmt::Debug for ScriptedRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedRunner")
            .field("rules", &self.rules.iter().map(|r| r.label.as_str()).collect::<Vec<_>>())
            .field("calls", &self.calls.lock().len())
            .finish()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &CommandSpec, cancel: &CancellationToken) -> Result<CommandOutput> {
        self.calls.lock().push(command.clone());
        if cancel.is_cancelled() {
            return Err(DeliverError::Cancelled(cancel.reason().unwrap_or_default()));
        }

        match self.rules.iter().find(|rule| (rule.matcher)(command)).map(|rule| &rule.reply) {
            Some(Reply::Respond(respond)) => respond(command),
            Some(Reply::Hang) => {
                cancel.cancelled().await;
                Err(DeliverError::Cancelled(cancel.reason().unwrap_or_default()))
            }
            None => Ok(CommandOutput::ok("")),
        }
    }
}

/// A stage that always fails with the failure class of its kind.
#[derive(Debug)]
pub struct FailingStage {
    name: String,
    kind: StageKind,
    error: String,
    exit_code: Option<i32>,
}

impl FailingStage {
    /// Creates a new failing script stage.
    #[must_use]
    pub fn new(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StageKind::Script,
            error: error.into(),
            exit_code: Some(1),
        }
    }

    /// Sets the stage kind.
    #[must_use]
    pub fn with_kind(mut self, kind: StageKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the reported exit code.
    #[must_use]
    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }
}

#[async_trait]
impl Stage for FailingStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn execute(&self, _ctx: &StageContext) -> StageOutput {
        StageOutput::failed(failure_for(self.kind, "script", self.error.clone(), self.exit_code))
    }
}

/// A stage that waits before succeeding.
#[derive(Debug)]
pub struct SlowStage {
    name: String,
    delay: Duration,
}

impl SlowStage {
    /// Creates a new slow stage.
    #[must_use]
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
        }
    }

    /// Creates a slow stage with delay in milliseconds.
    #[must_use]
    pub fn with_delay_ms(name: impl Into<String>, ms: u64) -> Self {
        Self::new(name, Duration::from_millis(ms))
    }
}

#[async_trait]
impl Stage for SlowStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let cancel = ctx.pipeline_ctx().cancel_token();
        tokio::select! {
            () = tokio::time::sleep(self.delay) => StageOutput::succeeded(),
            () = cancel.cancelled() => StageOutput::cancelled(cancel.reason().unwrap_or_default()),
        }
    }
}

/// What a [`RecordingStage`] saw when it ran.
#[derive(Debug, Clone)]
pub struct RecordedExecution {
    /// Stage name from context.
    pub stage_name: String,
    /// Dependency set it was allowed to read.
    pub needs: Vec<String>,
    /// Files present in its workspace, relative and sorted.
    pub workspace_files: Vec<String>,
    /// Run-scoped variables it received.
    pub env: Vec<(String, String)>,
}

/// A stage that records its context and succeeds, optionally writing files.
#[derive(Debug)]
pub struct RecordingStage {
    name: String,
    writes: Vec<(String, String)>,
    executions: Mutex<Vec<RecordedExecution>>,
}

impl RecordingStage {
    /// Creates a new recording stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            writes: Vec::new(),
            executions: Mutex::new(Vec::new()),
        }
    }

    /// Writes `contents` to `path` in the workspace when executed.
    #[must_use]
    pub fn writing(mut self, path: impl Into<String>, contents: impl Into<String>) -> Self {
        self.writes.push((path.into(), contents.into()));
        self
    }

    /// Returns all recorded executions.
    #[must_use]
    pub fn executions(&self) -> Vec<RecordedExecution> {
        self.executions.lock().clone()
    }

    /// Returns the number of executions.
    #[must_use]
    pub fn execution_count(&self) -> usize {
        self.executions.lock().len()
    }
}

fn list_files(root: &std::path::Path) -> Vec<String> {
    fn walk(root: &std::path::Path, dir: &std::path::Path, out: &mut Vec<String>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(root, &path, out);
            } else if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    let mut out = Vec::new();
    walk(root, root, &mut out);
    out.sort();
    out
}

#[async_trait]
impl Stage for RecordingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let workspace = ctx.sandbox().workspace();
        self.executions.lock().push(RecordedExecution {
            stage_name: ctx.stage_name().to_string(),
            needs: ctx.inputs().needs().iter().cloned().collect(),
            workspace_files: list_files(workspace),
            env: ctx.sandbox().env().iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        });

        for (path, contents) in &self.writes {
            let target = workspace.join(path);
            let written = target
                .parent()
                .map_or(Ok(()), std::fs::create_dir_all)
                .and_then(|()| std::fs::write(&target, contents));
            if let Err(err) = written {
                return StageOutput::failed(failure_for(StageKind::Script, "write", err.to_string(), None));
            }
        }
        StageOutput::succeeded()
    }
}
