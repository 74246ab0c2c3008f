//! Execution event model.
//!
//! Every observable transition during a run is an [`ExecutionEvent`]. Events
//! are appended to the run's log by the manager and fanned out to live
//! subscribers; the wire format is JSON with a snake_case `type` tag.
//!
//! Timestamps serialize as RFC3339 with nanoseconds (chrono's default).
//! Durations serialize as integer nanoseconds so every event round-trips
//! through JSON without information loss.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Discriminator for the event union.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    StepStarted,
    StepProgress,
    StepCompleted,
    StepFailed,
    StepSkipped,
    StepRetrying,
    StepActionStarted,
    StepActionCompleted,
    StepActionFailed,
}

impl EventKind {
    /// Whether this kind terminates a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::WorkflowCompleted | Self::WorkflowFailed)
    }
}

mod duration_nanos {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_nanos().min(u128::from(u64::MAX)) as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let nanos: Option<u64> = Option::deserialize(deserializer)?;
        Ok(nanos.map(Duration::from_nanos))
    }
}

/// A timestamped record of a state change during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Sub-step handle, e.g. a single tool call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    /// 1-based attempt number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    /// Nanoseconds.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "duration_nanos")]
    pub duration: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl ExecutionEvent {
    pub fn new(kind: EventKind, run_id: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            run_id: run_id.into(),
            step_id: None,
            action_id: None,
            attempt: None,
            duration: None,
            text: None,
            error: None,
            metadata: None,
        }
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_action(mut self, action_id: impl Into<String>) -> Self {
        self.action_id = Some(action_id.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_error(mut self, error: impl std::fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }
}

/// Where the runner pushes events.
///
/// `emit` must never block: fan-out to slow consumers is the manager's
/// problem, not the producer's.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ExecutionEvent);
}

/// Wrapper that stamps run and step identity onto provider-emitted events.
///
/// Providers report progress (tool calls, intermediate output) without
/// knowing which run or step they serve; the runner wraps its sink in a
/// `ScopedSink` so every event lands correctly attributed.
pub struct ScopedSink<'a> {
    inner: &'a dyn EventSink,
    run_id: String,
    step_id: String,
}

impl<'a> ScopedSink<'a> {
    pub fn new(inner: &'a dyn EventSink, run_id: impl Into<String>, step_id: impl Into<String>) -> Self {
        Self {
            inner,
            run_id: run_id.into(),
            step_id: step_id.into(),
        }
    }
}

impl EventSink for ScopedSink<'_> {
    fn emit(&self, mut event: ExecutionEvent) {
        event.run_id = self.run_id.clone();
        if event.step_id.is_none() {
            event.step_id = Some(self.step_id.clone());
        }
        self.inner.emit(event);
    }
}

/// Sink that discards everything. Useful in tests and for detached calls.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: ExecutionEvent) {}
}

/// Sink backed by an unbounded channel.
pub struct ChannelSink {
    tx: tokio::sync::mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: ExecutionEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: EventKind) -> ExecutionEvent {
        ExecutionEvent::new(kind, "run-1")
            .with_step("summarize")
            .with_action("toolu_42")
            .with_attempt(2)
            .with_duration(Duration::new(1, 234_567_891))
            .with_text("progress text")
            .with_error("boom")
            .with_metadata("tokens", serde_json::json!(128))
    }

    #[test]
    fn test_every_kind_round_trips() {
        let kinds = [
            EventKind::WorkflowStarted,
            EventKind::WorkflowCompleted,
            EventKind::WorkflowFailed,
            EventKind::StepStarted,
            EventKind::StepProgress,
            EventKind::StepCompleted,
            EventKind::StepFailed,
            EventKind::StepSkipped,
            EventKind::StepRetrying,
            EventKind::StepActionStarted,
            EventKind::StepActionCompleted,
            EventKind::StepActionFailed,
        ];
        for kind in kinds {
            let event = sample(kind);
            let json = serde_json::to_string(&event).unwrap();
            let back: ExecutionEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(back, event, "kind {kind:?} must round-trip losslessly");
        }
    }

    #[test]
    fn test_wire_tag_is_snake_case() {
        let event = ExecutionEvent::new(EventKind::StepActionCompleted, "run-1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step_action_completed");
    }

    #[test]
    fn test_duration_serializes_as_nanoseconds() {
        let event =
            ExecutionEvent::new(EventKind::StepCompleted, "r").with_duration(Duration::new(2, 5));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["duration"], 2_000_000_005u64);
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let event = ExecutionEvent::new(EventKind::WorkflowStarted, "run-1");
        let json = serde_json::to_value(&event).unwrap();
        let object = json.as_object().unwrap();
        assert!(!object.contains_key("step_id"));
        assert!(!object.contains_key("duration"));
        assert!(!object.contains_key("error"));
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(EventKind::WorkflowCompleted.is_terminal());
        assert!(EventKind::WorkflowFailed.is_terminal());
        assert!(!EventKind::StepCompleted.is_terminal());
    }
}
