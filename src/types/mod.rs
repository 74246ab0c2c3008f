//! Shared data types: messages, requests, models, workflow definitions.

pub mod message;
pub mod model;
pub mod request;
pub mod workflow;

pub use message::{ContentBlock, ImageSource, Message, Role, assistant_text};
pub use model::{ModelInfo, resolve_model_id};
pub use request::{GenerateOutput, GenerateRequest, TokenUsage, ToolSpec};
pub use workflow::{
    AgentConfig, InputSpec, InputType, RetryConfig, Step, StepOutcome, StepState, Workflow,
    WorkflowMetadata,
};
