//! Provider adapters.
//!
//! A [`Provider`] turns the uniform [`GenerateRequest`] contract into a
//! backend-specific exchange. Two reference backends ship with the crate:
//! an HTTP adapter for the Anthropic Messages API and a subprocess adapter
//! driving a local `claude` CLI over streaming JSON.

pub mod anthropic;
pub mod claude_code;
pub mod registry;

use async_trait::async_trait;

use crate::error::LacquerError;
use crate::events::EventSink;
use crate::types::model::ModelInfo;
use crate::types::request::{GenerateOutput, GenerateRequest};

pub use anthropic::AnthropicProvider;
pub use claude_code::ClaudeCodeProvider;
pub use registry::ProviderRegistry;

/// A model backend.
///
/// Implementations are `Send + Sync` and shared as `Arc<dyn Provider>`; one
/// instance serves all concurrent runs.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Produce assistant messages for a request.
    ///
    /// Progress (tool use, intermediate output) may be reported through
    /// `events` before the call returns. Cancellation is observed via
    /// `request.cancel`; subprocess-backed implementations must kill their
    /// child when it fires.
    async fn generate(
        &self,
        request: GenerateRequest,
        events: &dyn EventSink,
    ) -> Result<GenerateOutput, LacquerError>;

    /// Stable provider identifier.
    fn name(&self) -> &str;

    /// Best-effort enumeration of models the backend will accept.
    async fn list_models(&self) -> Result<Vec<ModelInfo>, LacquerError>;

    /// Release long-lived resources.
    async fn close(&self) -> Result<(), LacquerError> {
        Ok(())
    }
}
