//! Execution engine: manager, runner and the glue that ties a run's
//! lifecycle to the manager's registry.

pub mod manager;
pub mod runner;

pub use manager::{
    ExecutionManager, ManagerSink, RunPhase, RunSnapshot, StartedRun, SubscribeOutcome,
};
pub use runner::WorkflowRunner;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::error;

use crate::events::{EventKind, ExecutionEvent};
use crate::types::workflow::Workflow;

/// Detach a run onto the runtime.
///
/// The HTTP handler calls this after [`ExecutionManager::start`] and returns
/// immediately; everything after that is observable only through the run's
/// event stream and status record. A panic inside the runner is caught and
/// converted into a `workflow_failed` terminal event so the run still reaches
/// a terminal phase.
pub fn spawn_run(
    manager: Arc<ExecutionManager>,
    runner: Arc<WorkflowRunner>,
    workflow: Arc<Workflow>,
    started: StartedRun,
) {
    tokio::spawn(async move {
        let run_id = started.run_id.clone();
        let sink = ManagerSink::new(manager.clone(), run_id.clone());

        let outcome = AssertUnwindSafe(runner.run_workflow(
            &workflow,
            &run_id,
            &started.inputs,
            &started.cancel,
            &sink,
        ))
        .catch_unwind()
        .await;

        match outcome {
            Ok(Ok(outputs)) => manager.finish(&run_id, Some(outputs), None),
            Ok(Err(err)) => manager.finish(&run_id, None, Some(&err)),
            Err(_panic) => {
                error!(run_id = %run_id, workflow_id = %workflow.id, "workflow runner panicked");
                let err = crate::error::LacquerError::internal("workflow execution failed");
                manager.append_event(
                    &run_id,
                    ExecutionEvent::new(EventKind::WorkflowFailed, &run_id).with_error(&err),
                );
                manager.finish(&run_id, None, Some(&err));
            }
        }
    });
}
