//! # Inference engines
//!
//! The inference collaborator seen from the pipeline: an [`InferenceEngine`]
//! turns a batch of [`ChatRequest`](crate::protocol::ChatRequest)s into
//! generations, and an [`EngineFactory`] starts replicas of it for a
//! processor configuration. The runtime keeps one pool of replicas per
//! processor and feeds it through the batching core.
//!
//! Shipped engines:
//!
//! * [`MockEngine`] - deterministic, in process
//! * `OpenAiEngine` - an OpenAI-compatible HTTP server (feature `openai`)

mod core_trait;
mod handler;
mod mock;
pub(crate) mod pool;

#[cfg(feature = "openai")]
mod openai;

pub use core_trait::{EngineFactory, InferenceEngine};
pub use mock::{MockEngine, MockEngineFactory, MockStats, Responder};

#[cfg(feature = "openai")]
pub use openai::{OpenAiEngine, OpenAiEngineFactory, DEFAULT_BASE_URL, DEFAULT_TIMEOUT};
