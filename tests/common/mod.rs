//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use lacquer::error::LacquerError;
use lacquer::events::EventSink;
use lacquer::providers::Provider;
use lacquer::types::message::Message;
use lacquer::types::model::ModelInfo;
use lacquer::types::request::{GenerateOutput, GenerateRequest, TokenUsage};
use lacquer::types::workflow::{
    AgentConfig, InputSpec, RetryConfig, Step, Workflow, WorkflowMetadata,
};

/// Scripted provider: fails the first `failures` calls with a retryable
/// error, then echoes the prompt.
pub struct MockProvider {
    pub name: String,
    pub failures: AtomicU32,
    pub calls: AtomicU32,
    pub delay: Duration,
    pub models: Vec<ModelInfo>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            name: "mock".to_string(),
            failures: AtomicU32::new(0),
            calls: AtomicU32::new(0),
            delay: Duration::ZERO,
            models: vec![ModelInfo::new("mock-model", "Mock Model")],
        }
    }
}

impl MockProvider {
    pub fn failing_first(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn generate(
        &self,
        request: GenerateRequest,
        _events: &dyn EventSink,
    ) -> Result<GenerateOutput, LacquerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.delay > Duration::ZERO {
            tokio::select! {
                _ = request.cancel.cancelled() => return Err(LacquerError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(LacquerError::api(500, "scripted failure"));
        }
        let prompt = request
            .messages
            .last()
            .map(Message::text)
            .unwrap_or_default();
        Ok(GenerateOutput {
            messages: vec![Message::assistant(format!("echo: {prompt}"))],
            usage: TokenUsage::new(10, 5),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, LacquerError> {
        Ok(self.models.clone())
    }
}

pub fn agent(provider: &str, model: &str) -> AgentConfig {
    AgentConfig {
        provider: provider.to_string(),
        model: model.to_string(),
        temperature: None,
        system_prompt: None,
    }
}

pub fn step(id: &str, agent: &str, prompt: &str) -> Step {
    Step {
        id: id.to_string(),
        agent: Some(agent.to_string()),
        prompt: Some(prompt.to_string()),
        condition: None,
        retry: None,
        depends_on: Vec::new(),
        tools: Vec::new(),
        outputs: HashMap::new(),
    }
}

pub fn step_with_retry(id: &str, agent: &str, prompt: &str, retry: RetryConfig) -> Step {
    let mut step = step(id, agent, prompt);
    step.retry = Some(retry);
    step
}

pub fn workflow(id: &str, steps: Vec<Step>) -> Workflow {
    Workflow {
        id: id.to_string(),
        version: "1.0.0".to_string(),
        metadata: Some(WorkflowMetadata {
            name: Some(id.to_string()),
            description: Some(format!("{id} test workflow")),
            author: None,
        }),
        agents: HashMap::from([("mock-agent".to_string(), agent("mock", "mock-model"))]),
        steps,
        inputs: HashMap::new(),
        outputs: HashMap::new(),
    }
}

pub fn workflow_with_inputs(
    id: &str,
    steps: Vec<Step>,
    inputs: HashMap<String, InputSpec>,
) -> Workflow {
    let mut workflow = workflow(id, steps);
    workflow.inputs = inputs;
    workflow
}
