//! Run-level and stage-level execution contexts.

use super::{RunEnvironment, StageInputs};
use crate::artifacts::ArtifactStore;
use crate::cancellation::CancellationToken;
use crate::core::StageEvent;
use crate::errors::Result;
use crate::events::{EventSink, NoOpEventSink};
use crate::exec::{CommandOutput, CommandRunner, CommandSpec, Sandbox};
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// Everything shared by the stages of one run.
pub struct PipelineContext {
    run_id: Uuid,
    pipeline: String,
    env: Arc<RunEnvironment>,
    store: Arc<ArtifactStore>,
    runner: Arc<dyn CommandRunner>,
    event_sink: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
}

impl PipelineContext {
    /// Creates a context with a fresh run id.
    #[must_use]
    pub fn new(env: Arc<RunEnvironment>, store: Arc<ArtifactStore>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            pipeline: "pipeline".to_string(),
            env,
            store,
            runner,
            event_sink: Arc::new(NoOpEventSink),
            cancel: Arc::new(CancellationToken::new()),
        }
    }

    /// Sets the run id.
    #[must_use]
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    /// Sets the pipeline name used in logs and reports.
    #[must_use]
    pub fn with_pipeline_name(mut self, name: impl Into<String>) -> Self {
        self.pipeline = name.into();
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Shares an externally owned cancellation token.
    #[must_use]
    pub fn with_cancel_token(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancel = token;
        self
    }

    /// The run id.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The pipeline name.
    #[must_use]
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// The run-scoped environment.
    #[must_use]
    pub fn env(&self) -> &Arc<RunEnvironment> {
        &self.env
    }

    /// The artifact store.
    #[must_use]
    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    /// The command runner.
    #[must_use]
    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    /// The cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &Arc<CancellationToken> {
        &self.cancel
    }

    /// Returns true once the run was aborted.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Emits an event tagged with the run id.
    pub fn try_emit_event(&self, event_type: &str, data: Option<serde_json::Value>) {
        let mut enriched = data.unwrap_or_else(|| serde_json::json!({}));
        if let serde_json::Value::Object(ref mut map) = enriched {
            map.insert("run_id".to_string(), serde_json::json!(self.run_id.to_string()));
            map.insert("pipeline".to_string(), serde_json::json!(&self.pipeline));
        }
        self.event_sink.try_emit(event_type, Some(enriched));
    }

    /// Emits a typed lifecycle event.
    pub fn record(&self, event: &StageEvent) {
        self.try_emit_event(&event.event_type, Some(event.payload()));
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("run_id", &self.run_id)
            .field("pipeline", &self.pipeline)
            .field("env", &self.env)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// The context handed to a single stage.
///
/// Owns the stage sandbox; dropping the context removes it.
pub struct StageContext {
    pipeline_ctx: Arc<PipelineContext>,
    stage_name: String,
    inputs: StageInputs,
    sandbox: Sandbox,
    log: Mutex<String>,
}

impl StageContext {
    /// Creates a new stage context.
    #[must_use]
    pub fn new(
        pipeline_ctx: Arc<PipelineContext>,
        stage_name: impl Into<String>,
        inputs: StageInputs,
        sandbox: Sandbox,
    ) -> Self {
        Self {
            pipeline_ctx,
            stage_name: stage_name.into(),
            inputs,
            sandbox,
            log: Mutex::new(String::new()),
        }
    }

    /// Returns the stage name.
    #[must_use]
    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    /// Returns the stage inputs.
    #[must_use]
    pub fn inputs(&self) -> &StageInputs {
        &self.inputs
    }

    /// Returns the stage sandbox.
    #[must_use]
    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Returns the run-scoped environment.
    #[must_use]
    pub fn env(&self) -> &RunEnvironment {
        self.pipeline_ctx.env()
    }

    /// Returns the pipeline context.
    #[must_use]
    pub fn pipeline_ctx(&self) -> &Arc<PipelineContext> {
        &self.pipeline_ctx
    }

    /// Returns true once the run was aborted.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.pipeline_ctx.is_cancelled()
    }

    /// Runs a command and appends it and its output to the stage log.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be started or the run is
    /// cancelled while it runs. A non-zero exit is returned as output.
    pub async fn exec(&self, command: CommandSpec) -> Result<CommandOutput> {
        self.log_line(&format!("$ {command}"));
        let output = self
            .pipeline_ctx
            .runner
            .run(&command, &self.pipeline_ctx.cancel)
            .await?;
        {
            let mut log = self.log.lock();
            log.push_str(&output.combined());
            if !log.is_empty() && !log.ends_with('\n') {
                log.push('\n');
            }
        }
        tracing::debug!(
            stage = %self.stage_name,
            program = %command.program,
            exit_code = output.exit_code,
            "command finished"
        );
        Ok(output)
    }

    /// Appends a line to the stage log.
    pub fn log_line(&self, line: &str) {
        let mut log = self.log.lock();
        log.push_str(line);
        log.push('\n');
    }

    /// Returns a copy of the stage log so far.
    #[must_use]
    pub fn log(&self) -> String {
        self.log.lock().clone()
    }

    /// Takes the stage log, leaving it empty.
    #[must_use]
    pub fn take_log(&self) -> String {
        std::mem::take(&mut *self.log.lock())
    }

    /// Emits an event tagged with the run id and stage name.
    pub fn try_emit_event(&self, event_type: &str, data: Option<serde_json::Value>) {
        let mut enriched = data.unwrap_or_else(|| serde_json::json!({}));
        if let serde_json::Value::Object(ref mut map) = enriched {
            map.insert("stage".to_string(), serde_json::json!(&self.stage_name));
        }
        self.pipeline_ctx.try_emit_event(event_type, Some(enriched));
    }
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("stage_name", &self.stage_name)
            .field("sandbox", &self.sandbox)
            .finish_non_exhaustive()
    }
}
