use async_trait::async_trait;

/// The per-batch work a batching loop delegates to.
///
/// A loop drains queued requests, asks the handler to assemble them into a
/// single model input, runs it, and hands the output back so the handler can
/// answer every request in the batch.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    type Request: Send;
    type ModelInput: Send + Sync;
    type ModelOutput: Send;

    /// Build the batch input from queued requests.
    async fn make_batch_input(&self, model_input: &mut Option<Self::ModelInput>, requests: &[Self::Request]);

    /// Run the model on one batch.
    async fn infer(&self, model_input: &Self::ModelInput) -> Self::ModelOutput;

    /// Answer every request in `batch`, leaving it and `input` empty.
    async fn handle_outputs(
        &self,
        batch: &mut Vec<Self::Request>,
        input: &mut Option<Self::ModelInput>,
        output: Self::ModelOutput,
    );

    /// Called once after the loop has stopped.
    async fn shutdown(&self) {}
}
