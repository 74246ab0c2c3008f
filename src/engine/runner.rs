//! Workflow runner.
//!
//! Executes one run: dependency-ordered steps, conditional skipping, per-step
//! retry, state propagation and event emission. One runner instance serves
//! every concurrent run; all per-run state lives on the stack of
//! [`WorkflowRunner::run_workflow`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::LacquerError;
use crate::events::{EventKind, EventSink, ExecutionEvent, ScopedSink};
use crate::expression::{ExpressionContext, ExpressionEngine};
use crate::providers::ProviderRegistry;
use crate::retry::sleep_cancellable;
use crate::types::message::{Message, assistant_text};
use crate::types::request::GenerateRequest;
use crate::types::workflow::{RetryConfig, Step, StepOutcome, StepState, Workflow};

pub struct WorkflowRunner {
    providers: Arc<ProviderRegistry>,
    engine: Arc<dyn ExpressionEngine>,
}

impl WorkflowRunner {
    pub fn new(providers: Arc<ProviderRegistry>, engine: Arc<dyn ExpressionEngine>) -> Self {
        Self { providers, engine }
    }

    /// Run `workflow` to completion, emitting events through `sink`.
    ///
    /// Exactly one terminal event is emitted: `workflow_completed` with the
    /// total duration, or `workflow_failed` carrying the error.
    pub async fn run_workflow(
        &self,
        workflow: &Workflow,
        run_id: &str,
        inputs: &Map<String, Value>,
        cancel: &CancellationToken,
        sink: &dyn EventSink,
    ) -> Result<Map<String, Value>, LacquerError> {
        let started = Instant::now();
        sink.emit(
            ExecutionEvent::new(EventKind::WorkflowStarted, run_id)
                .with_metadata("workflow_id", Value::String(workflow.id.clone())),
        );

        match self.execute(workflow, run_id, inputs, cancel, sink).await {
            Ok(outputs) => {
                sink.emit(
                    ExecutionEvent::new(EventKind::WorkflowCompleted, run_id)
                        .with_duration(started.elapsed()),
                );
                Ok(outputs)
            }
            Err(err) => {
                sink.emit(
                    ExecutionEvent::new(EventKind::WorkflowFailed, run_id)
                        .with_duration(started.elapsed())
                        .with_error(&err),
                );
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        workflow: &Workflow,
        run_id: &str,
        inputs: &Map<String, Value>,
        cancel: &CancellationToken,
        sink: &dyn EventSink,
    ) -> Result<Map<String, Value>, LacquerError> {
        // Cycles were rejected at load time; this also fixes the order.
        let order = workflow.execution_order()?;
        let mut state: HashMap<String, StepState> = HashMap::new();

        for index in order {
            let step = &workflow.steps[index];

            if cancel.is_cancelled() {
                return Err(LacquerError::Cancelled);
            }

            if let Some(condition) = &step.condition {
                let ctx = ExpressionContext::new(inputs, &state);
                if !self.engine.eval_condition(condition, &ctx)? {
                    debug!(run_id = %run_id, step_id = %step.id, "condition falsy, skipping step");
                    sink.emit(
                        ExecutionEvent::new(EventKind::StepSkipped, run_id).with_step(&step.id),
                    );
                    state.insert(step.id.clone(), StepState::skipped());
                    continue;
                }
            }

            let step_started = Instant::now();
            match self
                .execute_step(workflow, step, run_id, inputs, &state, cancel, sink)
                .await
            {
                Ok(mut step_state) => {
                    let elapsed = step_started.elapsed();
                    step_state.duration =
                        Some(elapsed.as_nanos().min(u128::from(u64::MAX)) as u64);
                    sink.emit(
                        ExecutionEvent::new(EventKind::StepCompleted, run_id)
                            .with_step(&step.id)
                            .with_duration(elapsed),
                    );
                    state.insert(step.id.clone(), step_state);
                }
                Err(err) => {
                    sink.emit(
                        ExecutionEvent::new(EventKind::StepFailed, run_id)
                            .with_step(&step.id)
                            .with_duration(step_started.elapsed())
                            .with_error(&err),
                    );
                    let mut failed = StepState::skipped();
                    failed.status = StepOutcome::Failed;
                    state.insert(step.id.clone(), failed);

                    // Remaining steps are abandoned.
                    return Err(if err.is_cancellation() {
                        err
                    } else {
                        LacquerError::StepFailed {
                            step_id: step.id.clone(),
                            message: err.to_string(),
                        }
                    });
                }
            }
        }

        let ctx = ExpressionContext::new(inputs, &state);
        let mut outputs = Map::new();
        for (name, template) in &workflow.outputs {
            let rendered = self.engine.render(template, &ctx)?;
            outputs.insert(name.clone(), Value::String(rendered));
        }
        Ok(outputs)
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_step(
        &self,
        workflow: &Workflow,
        step: &Step,
        run_id: &str,
        inputs: &Map<String, Value>,
        state: &HashMap<String, StepState>,
        cancel: &CancellationToken,
        sink: &dyn EventSink,
    ) -> Result<StepState, LacquerError> {
        let agent_name = step.agent.as_deref().ok_or_else(|| {
            LacquerError::Configuration(format!("step '{}' has no agent", step.id))
        })?;
        let agent = workflow.agents.get(agent_name).ok_or_else(|| {
            LacquerError::Configuration(format!(
                "step '{}' references unknown agent '{agent_name}'",
                step.id
            ))
        })?;
        let template = step.prompt.as_deref().ok_or_else(|| {
            LacquerError::Configuration(format!("step '{}' has no prompt", step.id))
        })?;

        let ctx = ExpressionContext::new(inputs, state);
        let prompt = self.engine.render(template, &ctx)?;
        let provider = self.providers.get(&agent.provider)?;

        let mut request = GenerateRequest::new(&agent.model, vec![Message::user(prompt)]);
        request.system_prompt = agent.system_prompt.clone();
        request.temperature = agent.temperature;
        request.tools = step.tools.clone();
        request
            .metadata
            .insert("workflow_id".to_string(), workflow.id.clone());
        request.metadata.insert("step_id".to_string(), step.id.clone());
        request.cancel = cancel.child_token();

        sink.emit(
            ExecutionEvent::new(EventKind::StepStarted, run_id)
                .with_step(&step.id)
                .with_attempt(1),
        );

        let retry = step.retry.clone().unwrap_or_default();
        let scoped = ScopedSink::new(sink, run_id, step.id.as_str());
        let output = self
            .invoke_with_retry(&provider, &request, &retry, run_id, &step.id, cancel, sink, &scoped)
            .await?;

        let text = assistant_text(&output.messages);
        let mut step_state = StepState {
            status: StepOutcome::Ok,
            output: Some(text),
            token_usage: Some(output.usage),
            duration: None,
            outputs: HashMap::new(),
        };

        if !step.outputs.is_empty() {
            // Step output templates see this step's own result.
            let mut with_self = state.clone();
            with_self.insert(step.id.clone(), step_state.clone());
            let ctx = ExpressionContext::new(inputs, &with_self);
            for (name, template) in &step.outputs {
                step_state
                    .outputs
                    .insert(name.clone(), self.engine.render(template, &ctx)?);
            }
        }

        Ok(step_state)
    }

    #[allow(clippy::too_many_arguments)]
    async fn invoke_with_retry(
        &self,
        provider: &Arc<dyn crate::providers::Provider>,
        request: &GenerateRequest,
        retry: &RetryConfig,
        run_id: &str,
        step_id: &str,
        cancel: &CancellationToken,
        sink: &dyn EventSink,
        scoped: &ScopedSink<'_>,
    ) -> Result<crate::types::request::GenerateOutput, LacquerError> {
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt = 1u32;

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(LacquerError::Cancelled),
                result = provider.generate(request.clone(), scoped) => result,
            };

            match result {
                Ok(output) => return Ok(output),
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) if attempt < max_attempts && err.is_retryable() => {
                    warn!(
                        run_id = %run_id,
                        step_id = %step_id,
                        attempt,
                        error = %err,
                        "transient step failure, retrying"
                    );
                    sleep_cancellable(retry.delay_duration(), cancel).await?;
                    attempt += 1;
                    sink.emit(
                        ExecutionEvent::new(EventKind::StepRetrying, run_id)
                            .with_step(step_id)
                            .with_attempt(attempt)
                            .with_error(&err),
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }
}
