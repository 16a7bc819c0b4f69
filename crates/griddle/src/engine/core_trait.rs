use async_trait::async_trait;
use crate::config::ProcessorConfig;
use crate::error::EngineError;
use crate::protocol::{ChatRequest, Generation};

/// A serving engine replica that turns chat requests into generations.
///
/// # Implementation Notes
///
/// Implementations should:
/// * Return exactly one result per request, in request order
/// * Report a failure that concerns a single request in that request's slot,
///   and fail the whole call only when no request could be served
/// * Be thread-safe; a replica is driven by a single worker, but it is shared
///   behind `&self`
///
/// # Example
///
/// ```ignore
/// use async_trait::async_trait;
/// use griddle::engine::InferenceEngine;
///
/// struct Upper;
///
/// #[async_trait]
/// impl InferenceEngine for Upper {
///     async fn generate(&self, requests: &[ChatRequest]) -> Result<Vec<Result<Generation, EngineError>>, EngineError> {
///         Ok(requests.iter().map(|r| Ok(Generation {
///             generated_text: r.last_user_message().unwrap_or_default().to_uppercase(),
///             num_generated_tokens: 1,
///             finish_reason: FinishReason::Stop,
///         })).collect())
///     }
/// }
/// ```
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Generates one completion per request.
    ///
    /// The outer error fails the whole batch; the inner ones belong to
    /// individual requests.
    async fn generate(&self, requests: &[ChatRequest]) -> Result<Vec<Result<Generation, EngineError>>, EngineError>;

    /// Releases whatever the replica holds. Called once, after its last batch.
    async fn shutdown(&self) {}
}

/// Creates engine replicas for a processor configuration.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    /// Starts replica number `replica` (zero based) for `config`.
    async fn create(
        &self,
        config: &ProcessorConfig,
        replica: usize,
    ) -> Result<Box<dyn InferenceEngine>, EngineError>;
}
