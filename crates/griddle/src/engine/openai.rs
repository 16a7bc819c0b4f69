//! An engine backed by an OpenAI-compatible chat completions server, such as
//! `vllm serve`.
//!
//! Guided decoding is passed through the server's extra request parameters
//! (`guided_json`, `guided_choice`, `guided_grammar`, `guided_regex` and
//! `guided_decoding_backend`).

use std::time::Duration;
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, trace};
use crate::config::{GuidedDecodingBackend, ProcessorConfig};
use crate::error::EngineError;
use crate::protocol::{ChatRequest, FinishReason, Generation, GuidedDecoding};
use super::core_trait::{EngineFactory, InferenceEngine};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Creates one HTTP client per replica, all pointed at the same server.
#[derive(Debug, Clone)]
pub struct OpenAiEngineFactory {
    base_url: String,
    timeout: Duration,
    api_key: Option<String>,
}

impl OpenAiEngineFactory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: DEFAULT_TIMEOUT,
            api_key: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

impl Default for OpenAiEngineFactory {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

#[async_trait]
impl EngineFactory for OpenAiEngineFactory {
    async fn create(
        &self,
        config: &ProcessorConfig,
        replica: usize,
    ) -> Result<Box<dyn InferenceEngine>, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        let endpoint = format!("{}{}", self.base_url.trim_end_matches('/'), COMPLETIONS_PATH);

        debug!(%endpoint, replica, "created completions client");
        Ok(Box::new(OpenAiEngine {
            client,
            endpoint,
            api_key: self.api_key.clone(),
            model: config.model_source().to_string(),
            backend: config.engine_options().guided_decoding_backend(),
            timeout: self.timeout,
        }))
    }
}

pub struct OpenAiEngine {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    backend: GuidedDecodingBackend,
    timeout: Duration,
}

impl OpenAiEngine {
    async fn complete(&self, request: &ChatRequest) -> Result<Generation, EngineError> {
        let body = completion_body(&self.model, self.backend, request);
        trace!(endpoint = %self.endpoint, "posting completion");

        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(status_error(status, detail));
        }

        let completion: CompletionResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::Timeout(self.timeout)
            } else {
                EngineError::MalformedGeneration(e.to_string())
            }
        })?;
        completion.into_generation()
    }

    fn transport_error(&self, err: reqwest::Error) -> EngineError {
        if err.is_timeout() {
            EngineError::Timeout(self.timeout)
        } else {
            EngineError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl InferenceEngine for OpenAiEngine {
    async fn generate(&self, requests: &[ChatRequest]) -> Result<Vec<Result<Generation, EngineError>>, EngineError> {
        Ok(join_all(requests.iter().map(|request| self.complete(request))).await)
    }
}

fn status_error(status: StatusCode, detail: String) -> EngineError {
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            EngineError::ResourceExhausted(format!("{status}: {detail}"))
        }
        _ => EngineError::Transport(format!("{status}: {detail}")),
    }
}

/// The JSON body for one chat completion.
pub(crate) fn completion_body(model: &str, backend: GuidedDecodingBackend, request: &ChatRequest) -> Value {
    let params = &request.sampling_params;
    let mut body = Map::new();
    body.insert("model".into(), json!(model));
    body.insert("messages".into(), json!(request.messages));
    body.insert("temperature".into(), json!(params.temperature));
    if let Some(max_tokens) = params.max_tokens {
        body.insert("max_tokens".into(), json!(max_tokens));
    }
    if let Some(top_p) = params.top_p {
        body.insert("top_p".into(), json!(top_p));
    }
    if let Some(seed) = params.seed {
        body.insert("seed".into(), json!(seed));
    }

    if let Some(guided) = &params.guided_decoding {
        let (key, value) = match guided {
            GuidedDecoding::Json(schema) => ("guided_json", schema.clone()),
            GuidedDecoding::Choice(choices) => ("guided_choice", json!(choices)),
            GuidedDecoding::Grammar(grammar) => ("guided_grammar", json!(grammar)),
            GuidedDecoding::Regex(regex) => ("guided_regex", json!(regex)),
        };
        body.insert(key.into(), value);
        body.insert("guided_decoding_backend".into(), json!(backend.as_ref()));
    }

    Value::Object(body)
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    completion_tokens: usize,
}

impl CompletionResponse {
    fn into_generation(self) -> Result<Generation, EngineError> {
        let tokens = self.usage.map(|u| u.completion_tokens);
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::MalformedGeneration("response has no choices".into()))?;
        let generated_text = choice.message.content.unwrap_or_default();
        let finish_reason = match choice.finish_reason.as_deref() {
            Some("length") => FinishReason::Length,
            _ => FinishReason::Stop,
        };

        Ok(Generation {
            num_generated_tokens: tokens.unwrap_or_else(|| generated_text.split_whitespace().count()),
            generated_text,
            finish_reason,
        })
    }
}
