//! Lacquer workflow execution core.
//!
//! Loads declarative YAML workflow definitions, accepts execution requests
//! over HTTP, runs workflows concurrently with bounded capacity, streams
//! progress events to WebSocket subscribers and collects final outputs.
//!
//! The moving parts:
//!
//! - [`engine::ExecutionManager`] — concurrency gate, run registry, event log
//!   and subscriber fan-out
//! - [`engine::WorkflowRunner`] — dependency-ordered step execution with
//!   retry, conditional skipping and state propagation
//! - [`providers`] — the uniform generate/list-models contract over
//!   heterogeneous backends (HTTP APIs, local subprocess CLIs)
//! - [`catalog::ModelCatalog`] — TTL'd on-disk cache of advertised models
//! - [`server`] — the REST + WebSocket surface

pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod expression;
pub mod parser;
pub mod providers;
pub mod retry;
pub mod server;
pub mod telemetry;
pub mod types;
pub mod validation;

/// Commonly used items.
pub mod prelude {
    pub use crate::engine::{ExecutionManager, RunPhase, WorkflowRunner, spawn_run};
    pub use crate::error::{FieldError, LacquerError};
    pub use crate::events::{EventKind, EventSink, ExecutionEvent};
    pub use crate::providers::{Provider, ProviderRegistry};
    pub use crate::types::{
        ContentBlock, GenerateOutput, GenerateRequest, Message, ModelInfo, Role, TokenUsage,
        Workflow,
    };
}
