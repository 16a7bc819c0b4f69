//! # Griddle
//!
//! Lazy, batched LLM inference over row datasets, with structured output.
//!
//! ## Overview
//!
//! A pipeline is declared in three steps and run in a fourth:
//!
//! 1. Describe the output record with a [`SchemaBuilder`]; its descriptor is
//!    handed to the engine's guided decoding backend.
//! 2. Configure the model, engine options, `batch_size` and `concurrency` in a
//!    [`ProcessorConfig`].
//! 3. Bind a preprocess and a postprocess row function into a [`Processor`]
//!    and [`apply`](Processor::apply) it to a [`Dataset`]. Nothing runs yet.
//! 4. [`materialize`](Dataset::materialize) the dataset on a [`Runtime`].
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use griddle::{
//!     build_llm_processor, ChatMessage, ChatRequest, Dataset, FieldType, GuidedDecoding,
//!     ProcessorConfig, Row, Runtime, SamplingParams, SchemaBuilder,
//!     engine::MockEngineFactory,
//! };
//!
//! # async fn run() -> griddle::Result<()> {
//! let schema = SchemaBuilder::new("Answer").field("answer", FieldType::Integer).build()?;
//! let config = ProcessorConfig::builder().model_source("unsloth/Llama-3.2-1B-Instruct").build()?;
//!
//! let processor = build_llm_processor(
//!     config,
//!     move |row: Row| {
//!         let id = row.get_i64("id")?;
//!         let params = SamplingParams {
//!             guided_decoding: Some(GuidedDecoding::json(&schema)),
//!             ..Default::default()
//!         };
//!         ChatRequest::new(vec![ChatMessage::user(format!("3 * {id} + 5 = ?"))], params).into_row()
//!     },
//!     |row: Row| Ok(Row::new().with("resp", row.get_str("generated_text")?)),
//! )?;
//!
//! let dataset = processor.apply(Dataset::range(30));
//! let rows = Runtime::scoped(Arc::new(MockEngineFactory::echo()), |runtime| async move {
//!     dataset.materialize(&runtime).await
//! }).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Each processor gets an engine pool the first time a runtime materializes
//! it: `concurrency` replicas created by the runtime's
//! [`EngineFactory`](engine::EngineFactory), each driven by a background worker
//! that drains a shared queue in batches of at most `batch_size`. Results come
//! back through per-row channels and are reassembled in input order.
//!
//! ## Features
//!
//! - **openai** - Enables `OpenAiEngine`, a client for OpenAI-compatible serving endpoints

mod communication;
mod core;

pub mod config;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod logging;
pub mod processor;
pub mod protocol;
pub mod runtime;
pub mod schema;

pub use config::{
    Dtype, EngineOption, EngineOptionKey, EngineOptions, GuidedDecodingBackend, ProcessorConfig,
    ProcessorConfigBuilder, ProcessorSettings,
};
pub use dataset::{Dataset, MaterializedDataset, RowFn};
pub use error::{
    BindingError, ConfigurationError, EngineError, Error, ExecutionError, Result, SchemaDefinitionError,
    SchemaViolation, StageError,
};
pub use processor::{build_llm_processor, Processor, ProcessorBuilder};
pub use protocol::{ChatMessage, ChatRequest, FinishReason, Generation, GuidedDecoding, Role, Row, SamplingParams};
pub use runtime::Runtime;
pub use schema::{Field, FieldType, OutputSchema, SchemaBuilder, StructuredOutput};
