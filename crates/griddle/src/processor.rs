//! # LLM processors
//!
//! A [`Processor`] binds a [`ProcessorConfig`] to two row functions:
//!
//! * `preprocess` turns an input row into a request row carrying `messages`
//!   and `sampling_params` (see [`ChatRequest::into_row`]);
//! * `postprocess` turns the request row, now extended with
//!   `generated_text`, `num_generated_tokens` and `finish_reason`, into the
//!   output row. Without one the extended row is the output.
//!
//! Applying a processor to a dataset appends three stages (`preprocess`,
//! `generate`, `postprocess`) and runs nothing.

use std::fmt;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;
use crate::config::ProcessorConfig;
use crate::dataset::{Dataset, RowFn, Stage};
use crate::error::{BindingError, StageError};
use crate::protocol::{ChatRequest, Row};

pub const PREPROCESS_STAGE: &str = "preprocess";
pub const GENERATE_STAGE: &str = "generate";
pub const POSTPROCESS_STAGE: &str = "postprocess";

/// A configured, bound LLM stage. Cheap to clone; clones share engine replicas.
#[derive(Clone)]
pub struct Processor {
    id: Uuid,
    config: Arc<ProcessorConfig>,
    preprocess: Arc<dyn RowFn>,
    postprocess: Option<Arc<dyn RowFn>>,
}

impl Processor {
    pub fn builder(config: ProcessorConfig) -> ProcessorBuilder {
        ProcessorBuilder::new(config)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Appends this processor's stages to `dataset`.
    pub fn apply(&self, dataset: Dataset) -> Dataset {
        let dataset = dataset
            .with_stage(Stage::map(PREPROCESS_STAGE, self.preprocess.clone()))
            .with_stage(Stage::generate(GENERATE_STAGE, self.id, self.config.clone()));
        match &self.postprocess {
            Some(postprocess) => dataset.with_stage(Stage::map(POSTPROCESS_STAGE, postprocess.clone())),
            None => dataset,
        }
    }
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Processor")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("postprocess", &self.postprocess.is_some())
            .finish_non_exhaustive()
    }
}

/// Binds row functions to a configuration.
///
/// Binding mistakes are recorded as they happen and reported by
/// [`ProcessorBuilder::build`].
pub struct ProcessorBuilder {
    config: ProcessorConfig,
    preprocess: Option<Arc<dyn RowFn>>,
    postprocess: Option<Arc<dyn RowFn>>,
    probe: Option<Row>,
    error: Option<BindingError>,
}

impl ProcessorBuilder {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            config,
            preprocess: None,
            postprocess: None,
            probe: None,
            error: None,
        }
    }

    pub fn preprocess<F>(mut self, f: F) -> Self
    where
        F: Fn(Row) -> Result<Row, StageError> + Send + Sync + 'static,
    {
        if self.preprocess.is_some() {
            self.error.get_or_insert(BindingError::AlreadyBound(PREPROCESS_STAGE));
        } else {
            self.preprocess = Some(Arc::new(f));
        }
        self
    }

    pub fn postprocess<F>(mut self, f: F) -> Self
    where
        F: Fn(Row) -> Result<Row, StageError> + Send + Sync + 'static,
    {
        if self.postprocess.is_some() {
            self.error.get_or_insert(BindingError::AlreadyBound(POSTPROCESS_STAGE));
        } else {
            self.postprocess = Some(Arc::new(f));
        }
        self
    }

    /// A sample input row. When set, `build` runs preprocess on it once and
    /// checks that the result is a request row.
    pub fn probe_row(mut self, row: Row) -> Self {
        self.probe = Some(row);
        self
    }

    pub fn build(self) -> Result<Processor, BindingError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let preprocess = self.preprocess.ok_or(BindingError::MissingPreprocess)?;

        if let Some(probe) = self.probe {
            let request_row = preprocess
                .call(probe)
                .map_err(|e| BindingError::IncompatiblePreprocess(e.to_string()))?;
            ChatRequest::from_row(&request_row)
                .map_err(|e| BindingError::IncompatiblePreprocess(e.to_string()))?;
        }

        let processor = Processor {
            id: Uuid::new_v4(),
            config: Arc::new(self.config),
            preprocess,
            postprocess: self.postprocess,
        };
        debug!(processor = %processor.id, model = processor.config.model_source(), "processor built");
        Ok(processor)
    }
}

/// Builds a processor from a configuration and its two row functions.
pub fn build_llm_processor<P, Q>(config: ProcessorConfig, preprocess: P, postprocess: Q) -> Result<Processor, BindingError>
where
    P: Fn(Row) -> Result<Row, StageError> + Send + Sync + 'static,
    Q: Fn(Row) -> Result<Row, StageError> + Send + Sync + 'static,
{
    ProcessorBuilder::new(config)
        .preprocess(preprocess)
        .postprocess(postprocess)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngineFactory;
    use crate::protocol::{ChatMessage, SamplingParams, GENERATED_TEXT};
    use crate::runtime::Runtime;

    fn config() -> ProcessorConfig {
        ProcessorConfig::builder().model_source("mock").batch_size(4).build().unwrap()
    }

    fn greet(row: Row) -> Result<Row, StageError> {
        let id = row.get_i64("id")?;
        let request = ChatRequest::new(vec![ChatMessage::user(format!("hello {id}"))], SamplingParams::default());
        Ok(request.into_row()?.with("id", id))
    }

    #[test]
    fn test_apply_appends_three_stages() {
        let processor = build_llm_processor(config(), greet, Ok).unwrap();

        let dataset = processor.apply(Dataset::range(3));

        assert_eq!(dataset.plan(), vec![PREPROCESS_STAGE, GENERATE_STAGE, POSTPROCESS_STAGE]);
        assert_eq!(dataset.len(), 3);
    }

    #[test]
    fn test_missing_preprocess() {
        let err = Processor::builder(config()).postprocess(Ok).build().unwrap_err();
        assert_eq!(err, BindingError::MissingPreprocess);
    }

    #[test]
    fn test_double_binding_is_rejected() {
        let err = Processor::builder(config())
            .preprocess(greet)
            .preprocess(greet)
            .build()
            .unwrap_err();
        assert_eq!(err, BindingError::AlreadyBound(PREPROCESS_STAGE));

        let err = Processor::builder(config())
            .preprocess(greet)
            .postprocess(Ok)
            .postprocess(Ok)
            .build()
            .unwrap_err();
        assert_eq!(err, BindingError::AlreadyBound(POSTPROCESS_STAGE));
    }

    #[test]
    fn test_probe_rejects_non_request_preprocess() {
        let err = Processor::builder(config())
            .preprocess(|row: Row| Ok(row.with("prompt", "no messages here")))
            .probe_row(Row::new().with("id", 1))
            .build()
            .unwrap_err();
        assert!(matches!(err, BindingError::IncompatiblePreprocess(_)));

        assert!(Processor::builder(config())
            .preprocess(greet)
            .probe_row(Row::new().with("id", 1))
            .build()
            .is_ok());
    }

    #[tokio::test]
    async fn test_without_postprocess_keeps_inference_row() {
        let processor = Processor::builder(config()).preprocess(greet).build().unwrap();
        let runtime = Runtime::new(Arc::new(MockEngineFactory::echo()));

        let rows = processor.apply(Dataset::range(2)).materialize(&runtime).await.unwrap().take_all();

        assert_eq!(rows[1].get_str(GENERATED_TEXT).unwrap(), "hello 1");
        assert_eq!(rows[1].get_i64("id").unwrap(), 1);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_clones_share_engine_replicas() {
        let factory = MockEngineFactory::echo();
        let stats = factory.stats();
        let runtime = Runtime::new(Arc::new(factory));
        let processor = build_llm_processor(config(), greet, Ok).unwrap();
        let clone = processor.clone();

        processor.apply(Dataset::range(2)).materialize(&runtime).await.unwrap();
        clone.apply(Dataset::range(2)).materialize(&runtime).await.unwrap();

        assert_eq!(stats.created(), 1);
        runtime.shutdown().await;
    }
}
