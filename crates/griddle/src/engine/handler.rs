use async_trait::async_trait;
use tracing::{debug, warn};
use crate::communication::QueueItem;
use crate::core::handler::BatchHandler;
use crate::error::EngineError;
use crate::protocol::{ChatRequest, Generation};
use super::core_trait::InferenceEngine;

/// A queued generation request and the channel its result goes back on.
pub(crate) type GenerationRequest = QueueItem<ChatRequest, Result<Generation, EngineError>>;

/// Runs batches of chat requests through one engine replica.
///
/// Every request in a batch is answered with its own result. When the engine
/// call as a whole fails, or returns the wrong number of results, each request
/// gets a copy of that error instead.
pub(crate) struct GenerationHandler {
    engine: Box<dyn InferenceEngine>,
    replica: usize,
}

impl GenerationHandler {
    pub fn new(engine: Box<dyn InferenceEngine>, replica: usize) -> Self {
        Self { engine, replica }
    }
}

#[async_trait]
impl BatchHandler for GenerationHandler {
    type Request = GenerationRequest;
    type ModelInput = Vec<ChatRequest>;
    type ModelOutput = Result<Vec<Result<Generation, EngineError>>, EngineError>;

    async fn make_batch_input(&self, model_input: &mut Option<Self::ModelInput>, requests: &[Self::Request]) {
        if requests.is_empty() {
            return;
        }
        model_input
            .get_or_insert_with(|| Vec::with_capacity(requests.len()))
            .extend(requests.iter().map(|item| item.input().clone()));
    }

    async fn infer(&self, model_input: &Self::ModelInput) -> Self::ModelOutput {
        debug!(replica = self.replica, batch = model_input.len(), "generating");
        self.engine.generate(model_input).await
    }

    async fn handle_outputs(
        &self,
        batch: &mut Vec<Self::Request>,
        input: &mut Option<Self::ModelInput>,
        output: Self::ModelOutput,
    ) {
        *input = None;

        let output = output.and_then(|generations| {
            if generations.len() == batch.len() {
                Ok(generations)
            } else {
                Err(EngineError::BatchSizeMismatch {
                    expected: batch.len(),
                    actual: generations.len(),
                })
            }
        });

        let mut abandoned = 0;
        match output {
            Ok(results) => {
                for (request, result) in batch.drain(..).zip(results) {
                    if let Err(err) = &result {
                        debug!(replica = self.replica, error = %err, "request failed");
                    }
                    if !request.respond(result) {
                        abandoned += 1;
                    }
                }
            }
            Err(err) => {
                warn!(replica = self.replica, error = %err, batch = batch.len(), "batch failed");
                for request in batch.drain(..) {
                    if !request.respond(Err(err.clone())) {
                        abandoned += 1;
                    }
                }
            }
        }

        if abandoned > 0 {
            warn!(replica = self.replica, abandoned, "dropped results for abandoned requests");
        }
    }

    async fn shutdown(&self) {
        debug!(replica = self.replica, "shutting down engine replica");
        self.engine.shutdown().await;
    }
}
