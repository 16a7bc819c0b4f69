//! A deterministic in-process engine for tests and offline runs.
//!
//! [`MockEngine`] answers every request with the text returned by a responder
//! closure and then behaves like a serving engine would with that text:
//! `max_tokens` truncates it (whitespace separated words stand in for
//! tokens) and guided decoding is enforced by validating the output against
//! the requested JSON schema or choice list.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use tracing::{debug, trace};
use crate::config::ProcessorConfig;
use crate::error::{EngineError, SchemaViolation};
use crate::protocol::{ChatRequest, FinishReason, Generation, GuidedDecoding};
use crate::schema::check_json_constraint;
use super::core_trait::{EngineFactory, InferenceEngine};

/// Produces the raw completion for one request.
pub type Responder = dyn Fn(&ChatRequest) -> Result<String, EngineError> + Send + Sync;

/// Counters shared by a factory and every replica it created.
#[derive(Debug, Default)]
pub struct MockStats {
    created: AtomicUsize,
    shut_down: AtomicUsize,
    requests: AtomicUsize,
    batches: AtomicUsize,
    max_batch: AtomicUsize,
}

impl MockStats {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn shut_down(&self) -> usize {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    /// Largest batch any replica was asked to generate.
    pub fn max_batch(&self) -> usize {
        self.max_batch.load(Ordering::SeqCst)
    }
}

pub struct MockEngine {
    replica: usize,
    responder: Arc<Responder>,
    latency: Option<Duration>,
    stats: Arc<MockStats>,
}

impl MockEngine {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&ChatRequest) -> Result<String, EngineError> + Send + Sync + 'static,
    {
        Self {
            replica: 0,
            responder: Arc::new(responder),
            latency: None,
            stats: Arc::default(),
        }
    }

    pub fn stats(&self) -> Arc<MockStats> {
        self.stats.clone()
    }

    fn complete(&self, request: &ChatRequest) -> Result<Generation, EngineError> {
        let text = (self.responder)(request)?;
        let (generated_text, num_generated_tokens, finish_reason) =
            truncate(&text, request.sampling_params.max_tokens);

        match &request.sampling_params.guided_decoding {
            Some(GuidedDecoding::Json(descriptor)) => check_json_constraint(descriptor, &generated_text)?,
            Some(GuidedDecoding::Choice(choices)) => {
                if !choices.iter().any(|c| *c == generated_text) {
                    return Err(SchemaViolation::NotAChoice(generated_text).into());
                }
            }
            Some(GuidedDecoding::Grammar(_)) | Some(GuidedDecoding::Regex(_)) => {
                trace!(replica = self.replica, "grammar and regex constraints are not checked");
            }
            None => {}
        }

        Ok(Generation {
            generated_text,
            num_generated_tokens,
            finish_reason,
        })
    }
}

impl fmt::Debug for MockEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockEngine")
            .field("replica", &self.replica)
            .field("latency", &self.latency)
            .finish_non_exhaustive()
    }
}

/// Keeps at most `max_tokens` words of `text`.
fn truncate(text: &str, max_tokens: Option<u32>) -> (String, usize, FinishReason) {
    let words = text.split_whitespace().count();
    match max_tokens {
        Some(limit) if words > limit as usize => {
            let kept: Vec<&str> = text.split_whitespace().take(limit as usize).collect();
            (kept.join(" "), kept.len(), FinishReason::Length)
        }
        _ => (text.to_string(), words, FinishReason::Stop),
    }
}

#[async_trait]
impl InferenceEngine for MockEngine {
    async fn generate(&self, requests: &[ChatRequest]) -> Result<Vec<Result<Generation, EngineError>>, EngineError> {
        self.stats.batches.fetch_add(1, Ordering::SeqCst);
        self.stats.requests.fetch_add(requests.len(), Ordering::SeqCst);
        self.stats.max_batch.fetch_max(requests.len(), Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        Ok(requests.iter().map(|request| self.complete(request)).collect())
    }

    async fn shutdown(&self) {
        self.stats.shut_down.fetch_add(1, Ordering::SeqCst);
    }
}

/// Creates [`MockEngine`] replicas that share one responder and one [`MockStats`].
pub struct MockEngineFactory {
    responder: Arc<Responder>,
    latency: Option<Duration>,
    failing_replica: Option<usize>,
    stats: Arc<MockStats>,
}

impl MockEngineFactory {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&ChatRequest) -> Result<String, EngineError> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            latency: None,
            failing_replica: None,
            stats: Arc::default(),
        }
    }

    /// Replies with the content of the last user message.
    pub fn echo() -> Self {
        Self::new(|request| Ok(request.last_user_message().unwrap_or_default().to_string()))
    }

    /// Delays every `generate` call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Makes the creation of replica `replica` fail.
    pub fn failing_on_replica(mut self, replica: usize) -> Self {
        self.failing_replica = Some(replica);
        self
    }

    pub fn stats(&self) -> Arc<MockStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn create(
        &self,
        config: &ProcessorConfig,
        replica: usize,
    ) -> Result<Box<dyn InferenceEngine>, EngineError> {
        if self.failing_replica == Some(replica) {
            return Err(EngineError::ResourceExhausted(format!(
                "no device left for replica {replica} of {}",
                config.model_source()
            )));
        }

        debug!(model = config.model_source(), replica, "starting mock engine");
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockEngine {
            replica,
            responder: self.responder.clone(),
            latency: self.latency,
            stats: self.stats.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use crate::protocol::{ChatMessage, SamplingParams};
    use crate::schema::{FieldType, SchemaBuilder};

    fn request(prompt: &str, sampling_params: SamplingParams) -> ChatRequest {
        ChatRequest::new(vec![ChatMessage::system("sys"), ChatMessage::user(prompt)], sampling_params)
    }

    #[test]
    fn test_truncate_counts_words() {
        assert_eq!(truncate("a b c", None), ("a b c".to_string(), 3, FinishReason::Stop));
        assert_eq!(truncate("a b c", Some(3)), ("a b c".to_string(), 3, FinishReason::Stop));
        assert_eq!(truncate("a  b c", Some(2)), ("a b".to_string(), 2, FinishReason::Length));
    }

    async fn generate_one(engine: &MockEngine, request: ChatRequest) -> Result<Generation, EngineError> {
        let mut out = engine.generate(&[request]).await.unwrap();
        assert_eq!(out.len(), 1);
        out.remove(0)
    }

    #[tokio::test]
    async fn test_echo_engine_replies_with_user_message() {
        let engine = MockEngine::new(|r| Ok(r.last_user_message().unwrap_or_default().to_string()));

        let out = generate_one(&engine, request("hello there", SamplingParams::default())).await.unwrap();

        assert_eq!(out.generated_text, "hello there");
        assert_eq!(out.num_generated_tokens, 2);
        assert_eq!(out.finish_reason, FinishReason::Stop);
        assert_eq!(engine.stats().requests(), 1);
    }

    #[tokio::test]
    async fn test_max_tokens_truncates() {
        let engine = MockEngine::new(|_| Ok("one two three four".to_string()));
        let params = SamplingParams { max_tokens: Some(2), ..Default::default() };

        let out = generate_one(&engine, request("x", params)).await.unwrap();

        assert_eq!(out.generated_text, "one two");
        assert_eq!(out.finish_reason, FinishReason::Length);
    }

    #[tokio::test]
    async fn test_guided_json_is_enforced() {
        let schema = SchemaBuilder::new("Answer")
            .field("answer", FieldType::Integer)
            .build()
            .unwrap();
        let params = SamplingParams {
            guided_decoding: Some(GuidedDecoding::json(&schema)),
            ..Default::default()
        };

        let good = MockEngine::new(|_| Ok(json!({"answer": 23}).to_string()));
        assert!(generate_one(&good, request("x", params.clone())).await.is_ok());

        let bad = MockEngine::new(|_| Ok(json!({"answer": "23"}).to_string()));
        let err = generate_one(&bad, request("x", params)).await.unwrap_err();
        assert!(matches!(err, EngineError::SchemaViolation(SchemaViolation::WrongType { .. })));
    }

    #[tokio::test]
    async fn test_guided_choice_is_enforced() {
        let params = SamplingParams {
            guided_decoding: Some(GuidedDecoding::Choice(vec!["yes".into(), "no".into()])),
            ..Default::default()
        };

        let engine = MockEngine::new(|_| Ok("maybe".to_string()));
        let err = generate_one(&engine, request("x", params)).await.unwrap_err();

        assert_eq!(err, EngineError::SchemaViolation(SchemaViolation::NotAChoice("maybe".into())));
    }

    #[tokio::test]
    async fn test_responder_error_stays_with_its_request() {
        let engine = MockEngine::new(|r| match r.last_user_message() {
            Some("boom") => Err(EngineError::MalformedGeneration("boom".into())),
            other => Ok(other.unwrap_or_default().to_string()),
        });

        let batch = [
            request("fine", SamplingParams::default()),
            request("boom", SamplingParams::default()),
            request("also fine", SamplingParams::default()),
        ];
        let out = engine.generate(&batch).await.unwrap();

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].as_ref().unwrap().generated_text, "fine");
        assert!(matches!(out[1], Err(EngineError::MalformedGeneration(_))));
        assert_eq!(out[2].as_ref().unwrap().generated_text, "also fine");
    }

    #[tokio::test]
    async fn test_factory_tracks_replicas() {
        let factory = MockEngineFactory::echo().with_latency(Duration::from_millis(1));
        let config = ProcessorConfig::builder().model_source("mock").build().unwrap();

        let first = factory.create(&config, 0).await.unwrap();
        let _second = factory.create(&config, 1).await.unwrap();
        first.shutdown().await;

        let stats = factory.stats();
        assert_eq!(stats.created(), 2);
        assert_eq!(stats.shut_down(), 1);
    }

    #[tokio::test]
    async fn test_factory_can_fail_a_replica() {
        let factory = MockEngineFactory::echo().failing_on_replica(0);
        let config = ProcessorConfig::builder().model_source("mock").build().unwrap();

        assert!(matches!(
            factory.create(&config, 0).await,
            Err(EngineError::ResourceExhausted(_))
        ));
        assert_eq!(factory.stats().created(), 0);
    }
}
