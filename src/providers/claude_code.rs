//! Local subprocess adapter for the `claude` CLI.
//!
//! Spawns the CLI with its streaming-JSON output flag and drains
//! newline-delimited records from stdout until a terminal `result` record is
//! seen, the process exits, or the caller cancels (which kills the child).
//!
//! Record discriminators: `system` (subtype `init` carries the session id),
//! `assistant` (an array of content blocks), `result` (final text, usage,
//! durations, cost). Anything that is not JSON is treated as plain text and
//! attributed to a synthetic assistant text block.

use std::process::Stdio;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use super::Provider;
use crate::error::LacquerError;
use crate::events::{EventKind, EventSink, ExecutionEvent};
use crate::types::message::{ContentBlock, Message, Role};
use crate::types::model::ModelInfo;
use crate::types::request::{GenerateOutput, GenerateRequest, TokenUsage};

pub const PROVIDER_NAME: &str = "claude_code";
const DEFAULT_COMMAND: &str = "claude";

#[derive(Debug, Clone)]
pub struct ClaudeCodeConfig {
    /// Executable to spawn. Defaults to `claude` on the PATH.
    pub command: String,
}

impl Default for ClaudeCodeConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_COMMAND.to_string(),
        }
    }
}

pub struct ClaudeCodeProvider {
    command: String,
}

impl ClaudeCodeProvider {
    pub fn new(config: ClaudeCodeConfig) -> Self {
        Self {
            command: config.command,
        }
    }

    fn build_args(request: &GenerateRequest) -> Vec<String> {
        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(Message::text)
            .unwrap_or_default();

        let mut args = vec![
            "-p".to_string(),
            prompt,
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--model".to_string(),
            request.model.clone(),
        ];
        if let Some(system) = &request.system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(system.clone());
        }
        args
    }
}

#[async_trait::async_trait]
impl Provider for ClaudeCodeProvider {
    async fn generate(
        &self,
        request: GenerateRequest,
        events: &dyn EventSink,
    ) -> Result<GenerateOutput, LacquerError> {
        request.validate()?;
        let cancel = request.cancel.clone();

        let mut child = Command::new(&self.command)
            .args(Self::build_args(&request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                LacquerError::Process(format!("spawning '{}': {err}", self.command))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LacquerError::Process("child stdout unavailable".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| LacquerError::Process("child stderr unavailable".to_string()))?;

        // Drained concurrently so a chatty child cannot fill the pipe and
        // stall while we still read stdout.
        let stderr_task = tokio::spawn(async move {
            let mut buffer = String::new();
            let _ = stderr.read_to_string(&mut buffer).await;
            buffer
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut collector = StreamCollector::default();

        let drained = loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    stderr_task.abort();
                    return Err(LacquerError::Cancelled);
                }
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    collector.push_line(&line, events);
                    if collector.finished() {
                        break true;
                    }
                }
                Ok(None) => break false,
                Err(err) => {
                    let _ = child.start_kill();
                    stderr_task.abort();
                    return Err(LacquerError::Process(format!("reading stdout: {err}")));
                }
            }
        };

        let status = if drained {
            // The CLI exits right after its result record; don't let a
            // lingering process hold the step open.
            match tokio::time::timeout(std::time::Duration::from_secs(5), child.wait()).await {
                Ok(_) => None,
                Err(_) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    None
                }
            }
        } else {
            Some(child.wait().await.map_err(|err| {
                LacquerError::Process(format!("waiting for child: {err}"))
            })?)
        };
        let stderr_text = stderr_task.await.unwrap_or_default();

        collector.into_output(status, &stderr_text)
    }

    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, LacquerError> {
        // The CLI has no listing endpoint; advertise the aliases it accepts.
        Ok(vec![
            ModelInfo::new("sonnet", "Claude Sonnet").with_features(&["chat", "tools"]),
            ModelInfo::new("opus", "Claude Opus").with_features(&["chat", "tools"]),
            ModelInfo::new("haiku", "Claude Haiku").with_features(&["chat", "tools"]),
        ])
    }
}

/// One NDJSON record from the CLI stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamRecord {
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        message: AssistantRecord,
    },
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        usage: Option<CliUsage>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct AssistantRecord {
    #[serde(default)]
    content: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct CliUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Accumulates stream records into the final output.
#[derive(Default)]
struct StreamCollector {
    messages: Vec<Message>,
    plain_text: String,
    usage: TokenUsage,
    result_text: Option<String>,
    result_error: bool,
    saw_result: bool,
}

impl StreamCollector {
    fn push_line(&mut self, line: &str, events: &dyn EventSink) {
        if line.trim().is_empty() {
            return;
        }
        let record: StreamRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(_) => {
                // Plain-text output from the CLI still counts as content.
                if !self.plain_text.is_empty() {
                    self.plain_text.push('\n');
                }
                self.plain_text.push_str(line);
                return;
            }
        };

        match record {
            StreamRecord::System {
                subtype,
                session_id,
            } => {
                debug!(subtype = %subtype, session_id = ?session_id, "cli session record");
            }
            StreamRecord::Assistant { message } => {
                let blocks: Vec<ContentBlock> = message
                    .content
                    .iter()
                    .filter_map(block_from_cli)
                    .collect();
                for block in &blocks {
                    match block {
                        ContentBlock::ToolUse { id, name, .. } => {
                            events.emit(
                                ExecutionEvent::new(EventKind::StepActionStarted, "")
                                    .with_action(id.clone())
                                    .with_text(name.clone()),
                            );
                        }
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => {
                            let kind = if *is_error {
                                EventKind::StepActionFailed
                            } else {
                                EventKind::StepActionCompleted
                            };
                            let mut event = ExecutionEvent::new(kind, "")
                                .with_action(tool_use_id.clone());
                            if *is_error {
                                event = event.with_error(content.clone());
                            }
                            events.emit(event);
                        }
                        _ => {}
                    }
                }
                if !blocks.is_empty() {
                    self.messages.push(Message::new(Role::Assistant, blocks));
                }
            }
            StreamRecord::Result {
                result,
                usage,
                session_id,
                duration_ms,
                total_cost_usd,
                is_error,
            } => {
                debug!(
                    session_id = ?session_id,
                    duration_ms = ?duration_ms,
                    cost_usd = ?total_cost_usd,
                    "cli result record"
                );
                if let Some(usage) = usage {
                    self.usage
                        .add(&TokenUsage::new(usage.input_tokens, usage.output_tokens));
                }
                self.result_text = result;
                self.result_error = is_error;
                self.saw_result = true;
            }
            StreamRecord::Unknown => {
                warn!("unrecognized cli stream record: {line}");
            }
        }
    }

    fn finished(&self) -> bool {
        self.saw_result
    }

    fn into_output(
        mut self,
        exit: Option<std::process::ExitStatus>,
        stderr: &str,
    ) -> Result<GenerateOutput, LacquerError> {
        if self.result_error {
            let detail = self
                .result_text
                .unwrap_or_else(|| "cli reported an error".to_string());
            return Err(LacquerError::Process(trim_with_stderr(&detail, stderr)));
        }

        if !self.saw_result {
            if let Some(status) = exit {
                if !status.success() {
                    return Err(LacquerError::Process(trim_with_stderr(
                        &format!("cli exited with {status}"),
                        stderr,
                    )));
                }
            }
        }

        if !self.plain_text.is_empty() {
            self.messages.push(Message::assistant(self.plain_text));
        }
        if self.messages.is_empty() {
            match self.result_text {
                Some(text) if !text.is_empty() => self.messages.push(Message::assistant(text)),
                _ => {
                    return Err(LacquerError::Process(trim_with_stderr(
                        "cli produced no output",
                        stderr,
                    )));
                }
            }
        }

        Ok(GenerateOutput {
            messages: self.messages,
            usage: self.usage,
        })
    }
}

fn block_from_cli(value: &Value) -> Option<ContentBlock> {
    match value.get("type").and_then(Value::as_str)? {
        "text" => Some(ContentBlock::Text {
            text: value
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        "tool_use" => Some(ContentBlock::ToolUse {
            id: value
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            name: value
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            input: value.get("input").cloned().unwrap_or(Value::Null),
        }),
        "tool_result" => Some(ContentBlock::ToolResult {
            tool_use_id: value
                .get("tool_use_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            content: value
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            is_error: value
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }),
        _ => None,
    }
}

fn trim_with_stderr(message: &str, stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        message.to_string()
    } else {
        // Keep the tail; that's where the actual failure usually is.
        let tail: String = stderr
            .lines()
            .rev()
            .take(10)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");
        format!("{message}: {tail}")
    }
}
