//! Execution manager.
//!
//! Owns every run: the concurrency gate, the per-run status record, the
//! append-only event log and the subscriber fan-out. The runner never touches
//! run state directly; it goes through manager operations keyed by run id.
//!
//! Locking: one registry mutex guards the run map and the active count; each
//! run has its own mutex over status, log and subscribers, so appending and
//! broadcasting for one run never contends with other runs, and a snapshot
//! plus subscriber registration is atomic (a late subscriber sees a gapless,
//! duplicate-free continuation of the log).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::LacquerError;
use crate::events::{EventKind, EventSink, ExecutionEvent};
use crate::telemetry::Metrics;

/// Bounded queue per subscriber; a consumer that falls this far behind is
/// evicted rather than ever blocking the producer.
const SUBSCRIBER_QUEUE: usize = 256;

/// Lifecycle phase of a run. Transitions are monotonic: `Running` moves to
/// exactly one terminal phase and never reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<ExecutionEvent>,
}

struct RunState {
    phase: RunPhase,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    duration: Option<Duration>,
    inputs: Map<String, Value>,
    outputs: Option<Map<String, Value>>,
    error: Option<String>,
    events: Vec<ExecutionEvent>,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
    cancel: CancellationToken,
}

struct Run {
    run_id: String,
    workflow_id: String,
    state: Mutex<RunState>,
}

struct RegistryState {
    runs: HashMap<String, Arc<Run>>,
    active: usize,
}

/// Handle returned by [`ExecutionManager::start`].
#[derive(Debug)]
pub struct StartedRun {
    pub run_id: String,
    pub workflow_id: String,
    pub started_at: DateTime<Utc>,
    pub inputs: Map<String, Value>,
    pub cancel: CancellationToken,
}

/// Serializable point-in-time view of a run, returned by the executions
/// endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub workflow_id: String,
    pub status: RunPhase,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Nanoseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    pub inputs: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub events: Vec<ExecutionEvent>,
}

/// What a new subscriber gets: the log so far, and a live receiver unless the
/// run already terminated (then a synthesized terminal event instead).
pub struct SubscribeOutcome {
    pub backlog: Vec<ExecutionEvent>,
    pub phase: RunPhase,
    pub live: Option<mpsc::Receiver<ExecutionEvent>>,
    pub terminal: Option<ExecutionEvent>,
}

pub struct ExecutionManager {
    registry: Mutex<RegistryState>,
    max_concurrency: usize,
    metrics: Arc<Metrics>,
}

impl ExecutionManager {
    pub fn new(max_concurrency: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            registry: Mutex::new(RegistryState {
                runs: HashMap::new(),
                active: 0,
            }),
            max_concurrency,
            metrics,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Advisory capacity check; the authoritative decision happens in
    /// [`start`](Self::start).
    pub fn can_start(&self) -> bool {
        let registry = self.registry.lock().expect("registry lock poisoned");
        registry.active < self.max_concurrency
    }

    pub fn active_count(&self) -> usize {
        self.registry.lock().expect("registry lock poisoned").active
    }

    /// Claim a concurrency slot and create the run record.
    pub fn start(
        &self,
        workflow_id: &str,
        inputs: Map<String, Value>,
    ) -> Result<StartedRun, LacquerError> {
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        if registry.active >= self.max_concurrency {
            return Err(LacquerError::AtCapacity {
                active: registry.active,
                max: self.max_concurrency,
            });
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let cancel = CancellationToken::new();
        let run = Arc::new(Run {
            run_id: run_id.clone(),
            workflow_id: workflow_id.to_string(),
            state: Mutex::new(RunState {
                phase: RunPhase::Running,
                started_at,
                ended_at: None,
                duration: None,
                inputs: inputs.clone(),
                outputs: None,
                error: None,
                events: Vec::new(),
                subscribers: Vec::new(),
                next_subscriber_id: 0,
                cancel: cancel.clone(),
            }),
        });
        registry.runs.insert(run_id.clone(), run);
        registry.active += 1;

        self.metrics.runs_total.inc();
        self.metrics.runs_active.set(registry.active as i64);
        info!(run_id = %run_id, workflow_id = %workflow_id, active = registry.active, "execution started");

        Ok(StartedRun {
            run_id,
            workflow_id: workflow_id.to_string(),
            started_at,
            inputs,
            cancel,
        })
    }

    fn run(&self, run_id: &str) -> Option<Arc<Run>> {
        let registry = self.registry.lock().expect("registry lock poisoned");
        registry.runs.get(run_id).cloned()
    }

    /// Append to the run's log and broadcast to live subscribers.
    ///
    /// Never blocks on a consumer: a subscriber whose queue is full (or whose
    /// socket task went away) is evicted on the spot.
    pub fn append_event(&self, run_id: &str, event: ExecutionEvent) {
        let Some(run) = self.run(run_id) else {
            debug!(run_id = %run_id, "dropping event for unknown run");
            return;
        };

        let mut state = run.state.lock().expect("run lock poisoned");
        state.events.push(event.clone());

        state.subscribers.retain(|subscriber| {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(err) => {
                    warn!(
                        run_id = %run_id,
                        subscriber = subscriber.id,
                        "evicting subscriber: {err}"
                    );
                    false
                }
            }
        });
    }

    /// Attach a subscriber to a run.
    pub fn subscribe(&self, run_id: &str) -> Option<SubscribeOutcome> {
        let run = self.run(run_id)?;
        let mut state = run.state.lock().expect("run lock poisoned");

        let backlog = state.events.clone();
        if state.phase.is_terminal() {
            return Some(SubscribeOutcome {
                backlog,
                phase: state.phase,
                live: None,
                terminal: Some(synthesize_terminal(&run, &state)),
            });
        }

        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        state.subscribers.push(Subscriber { id, tx });
        debug!(run_id = %run_id, subscriber = id, backlog = backlog.len(), "subscriber attached");

        Some(SubscribeOutcome {
            backlog,
            phase: state.phase,
            live: Some(rx),
            terminal: None,
        })
    }

    pub fn get(&self, run_id: &str) -> Option<RunSnapshot> {
        let run = self.run(run_id)?;
        let state = run.state.lock().expect("run lock poisoned");
        Some(RunSnapshot {
            run_id: run.run_id.clone(),
            workflow_id: run.workflow_id.clone(),
            status: state.phase,
            started_at: state.started_at,
            ended_at: state.ended_at,
            duration: state
                .duration
                .map(|d| d.as_nanos().min(u128::from(u64::MAX)) as u64),
            inputs: state.inputs.clone(),
            outputs: state.outputs.clone(),
            error: state.error.clone(),
            events: state.events.clone(),
        })
    }

    /// Fire the run's cancellation token. The runner observes it at its next
    /// suspension point and finishes the run with a cancellation error.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.run(run_id) {
            Some(run) => {
                let state = run.state.lock().expect("run lock poisoned");
                info!(run_id = %run_id, "cancellation requested");
                state.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Transition the run to its terminal phase and release its slot.
    ///
    /// Idempotent: a second call for the same run (or an unknown run id) is a
    /// no-op, so the slot is never double-released.
    pub fn finish(
        &self,
        run_id: &str,
        outputs: Option<Map<String, Value>>,
        error: Option<&LacquerError>,
    ) {
        let Some(run) = self.run(run_id) else {
            return;
        };

        let (phase, duration) = {
            let mut state = run.state.lock().expect("run lock poisoned");
            if state.phase.is_terminal() {
                return;
            }

            let ended_at = Utc::now();
            let duration = (ended_at - state.started_at).to_std().unwrap_or_default();
            state.ended_at = Some(ended_at);
            state.duration = Some(duration);

            match error {
                None => {
                    state.phase = RunPhase::Completed;
                    state.outputs = outputs;
                }
                Some(err) => {
                    state.phase = RunPhase::Failed;
                    state.error = Some(err.to_string());
                }
            }

            // Dropping the senders closes every live stream.
            state.subscribers.clear();
            (state.phase, duration)
        };

        let active = {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            registry.active = registry.active.saturating_sub(1);
            registry.active
        };

        self.metrics.runs_active.set(active as i64);
        self.metrics
            .run_duration_seconds
            .with_label_values(&[&run.workflow_id, phase.as_str()])
            .observe(duration.as_secs_f64());
        self.metrics
            .run_status_total
            .with_label_values(&[&run.workflow_id, phase.as_str()])
            .inc();

        info!(
            run_id = %run_id,
            workflow_id = %run.workflow_id,
            status = phase.as_str(),
            duration_ms = duration.as_millis() as u64,
            active,
            "execution finished"
        );
    }

    /// Ids of runs still in the `Running` phase.
    pub fn running_ids(&self) -> Vec<String> {
        let registry = self.registry.lock().expect("registry lock poisoned");
        registry
            .runs
            .values()
            .filter(|run| {
                let state = run.state.lock().expect("run lock poisoned");
                state.phase == RunPhase::Running
            })
            .map(|run| run.run_id.clone())
            .collect()
    }

    /// Wait up to `grace` for active runs to finish, then cancel stragglers.
    pub async fn shutdown(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        while self.active_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let stragglers = self.running_ids();
        if !stragglers.is_empty() {
            warn!(count = stragglers.len(), "cancelling runs still active at shutdown");
            for run_id in stragglers {
                self.cancel(&run_id);
            }
        }
    }
}

fn synthesize_terminal(run: &Run, state: &RunState) -> ExecutionEvent {
    let kind = match state.phase {
        RunPhase::Completed => EventKind::WorkflowCompleted,
        _ => EventKind::WorkflowFailed,
    };
    let mut event = ExecutionEvent::new(kind, run.run_id.clone());
    if let Some(duration) = state.duration {
        event = event.with_duration(duration);
    }
    if let Some(error) = &state.error {
        event = event.with_error(error);
    }
    event
}

/// Adapter that lets the runner push events through the manager.
pub struct ManagerSink {
    manager: Arc<ExecutionManager>,
    run_id: String,
}

impl ManagerSink {
    pub fn new(manager: Arc<ExecutionManager>, run_id: impl Into<String>) -> Self {
        Self {
            manager,
            run_id: run_id.into(),
        }
    }
}

impl EventSink for ManagerSink {
    fn emit(&self, event: ExecutionEvent) {
        self.manager.append_event(&self.run_id, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max: usize) -> ExecutionManager {
        ExecutionManager::new(max, Arc::new(Metrics::new().unwrap()))
    }

    fn event(run_id: &str, kind: EventKind) -> ExecutionEvent {
        ExecutionEvent::new(kind, run_id)
    }

    #[test]
    fn test_capacity_zero_rejects_everything() {
        let manager = manager(0);
        assert!(!manager.can_start());
        let err = manager.start("wf", Map::new()).unwrap_err();
        assert!(matches!(err, LacquerError::AtCapacity { .. }));
        assert!(err.to_string().contains("at capacity"));
    }

    #[test]
    fn test_capacity_accounting() {
        let manager = manager(1);
        let run = manager.start("wf", Map::new()).unwrap();
        assert_eq!(manager.active_count(), 1);
        assert!(!manager.can_start());
        assert!(manager.start("wf", Map::new()).is_err());

        manager.finish(&run.run_id, Some(Map::new()), None);
        assert_eq!(manager.active_count(), 0);
        assert!(manager.can_start());
    }

    #[test]
    fn test_finish_is_idempotent() {
        let manager = manager(2);
        let a = manager.start("wf", Map::new()).unwrap();
        let _b = manager.start("wf", Map::new()).unwrap();
        assert_eq!(manager.active_count(), 2);

        manager.finish(&a.run_id, None, Some(&LacquerError::Cancelled));
        manager.finish(&a.run_id, None, Some(&LacquerError::Cancelled));
        manager.finish("no-such-run", None, None);
        assert_eq!(manager.active_count(), 1);

        let snapshot = manager.get(&a.run_id).unwrap();
        assert_eq!(snapshot.status, RunPhase::Failed);
        assert!(snapshot.error.unwrap().starts_with("execution cancelled"));
    }

    #[test]
    fn test_phase_is_monotonic() {
        let manager = manager(1);
        let run = manager.start("wf", Map::new()).unwrap();
        manager.finish(&run.run_id, Some(Map::new()), None);
        // A late failure report must not flip a completed run.
        manager.finish(&run.run_id, None, Some(&LacquerError::internal("late")));
        assert_eq!(manager.get(&run.run_id).unwrap().status, RunPhase::Completed);
    }

    #[tokio::test]
    async fn test_subscriber_sees_backlog_then_live_tail() {
        let manager = manager(1);
        let run = manager.start("wf", Map::new()).unwrap();
        manager.append_event(&run.run_id, event(&run.run_id, EventKind::WorkflowStarted));
        manager.append_event(&run.run_id, event(&run.run_id, EventKind::StepStarted));

        let outcome = manager.subscribe(&run.run_id).unwrap();
        assert_eq!(outcome.backlog.len(), 2);
        let mut rx = outcome.live.unwrap();

        manager.append_event(&run.run_id, event(&run.run_id, EventKind::StepCompleted));
        let live = rx.recv().await.unwrap();
        assert_eq!(live.kind, EventKind::StepCompleted);

        manager.finish(&run.run_id, Some(Map::new()), None);
        assert!(rx.recv().await.is_none(), "channel closes on finish");
    }

    #[test]
    fn test_subscribe_to_finished_run_synthesizes_terminal() {
        let manager = manager(1);
        let run = manager.start("wf", Map::new()).unwrap();
        manager.append_event(&run.run_id, event(&run.run_id, EventKind::WorkflowStarted));
        manager.finish(&run.run_id, Some(Map::new()), None);

        let outcome = manager.subscribe(&run.run_id).unwrap();
        assert_eq!(outcome.backlog.len(), 1);
        assert!(outcome.live.is_none());
        assert_eq!(outcome.terminal.unwrap().kind, EventKind::WorkflowCompleted);
    }

    #[test]
    fn test_slow_subscriber_is_evicted_not_blocking() {
        let manager = manager(1);
        let run = manager.start("wf", Map::new()).unwrap();
        let outcome = manager.subscribe(&run.run_id).unwrap();
        let _rx = outcome.live.unwrap();

        // Push past the queue bound without ever draining.
        for _ in 0..(SUBSCRIBER_QUEUE + 10) {
            manager.append_event(&run.run_id, event(&run.run_id, EventKind::StepProgress));
        }

        // The producer never blocked and the log kept every event.
        let snapshot = manager.get(&run.run_id).unwrap();
        assert_eq!(snapshot.events.len(), SUBSCRIBER_QUEUE + 10);
    }

    #[test]
    fn test_cancel_fires_token() {
        let manager = manager(1);
        let run = manager.start("wf", Map::new()).unwrap();
        assert!(!run.cancel.is_cancelled());
        assert!(manager.cancel(&run.run_id));
        assert!(run.cancel.is_cancelled());
        assert!(!manager.cancel("unknown"));
    }
}
