//! # Lazy datasets
//!
//! A [`Dataset`] is a source of rows plus an ordered list of stages. Building
//! one (`range`, `from_rows`, `map`, or [`Processor::apply`](crate::Processor::apply))
//! only records work; [`Dataset::materialize`] runs it.
//!
//! Every stage is one row in, one row out, so a materialized dataset always
//! has as many rows as its source, in the same order. A failure anywhere
//! aborts the whole run and carries the index of the row that failed.
//!
//! Materializing the same `Dataset` twice runs the whole graph twice. Keep the
//! [`MaterializedDataset`] to reuse results.

mod materialized;

use std::fmt;
use std::sync::Arc;
use futures::future::try_join_all;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;
use crate::config::ProcessorConfig;
use crate::error::{ExecutionError, StageError};
use crate::protocol::{ChatRequest, Row};
use crate::runtime::Runtime;

pub use materialized::MaterializedDataset;

/// A row-in, row-out transformation.
///
/// Implemented for every `Fn(Row) -> Result<Row, StageError>` closure.
pub trait RowFn: Send + Sync {
    fn call(&self, row: Row) -> Result<Row, StageError>;
}

impl<F> RowFn for F
where
    F: Fn(Row) -> Result<Row, StageError> + Send + Sync,
{
    fn call(&self, row: Row) -> Result<Row, StageError> {
        self(row)
    }
}

#[derive(Clone)]
pub(crate) enum StageKind {
    Map(Arc<dyn RowFn>),
    Generate {
        processor: Uuid,
        config: Arc<ProcessorConfig>,
    },
}

#[derive(Clone)]
pub(crate) struct Stage {
    name: String,
    kind: StageKind,
}

impl Stage {
    pub(crate) fn map(name: impl Into<String>, f: Arc<dyn RowFn>) -> Self {
        Self { name: name.into(), kind: StageKind::Map(f) }
    }

    pub(crate) fn generate(name: impl Into<String>, processor: Uuid, config: Arc<ProcessorConfig>) -> Self {
        Self {
            name: name.into(),
            kind: StageKind::Generate { processor, config },
        }
    }
}

/// A lazily evaluated row dataset.
#[derive(Clone)]
pub struct Dataset {
    source: Arc<Vec<Row>>,
    stages: Vec<Stage>,
}

impl Dataset {
    /// Rows `{"id": 0}` through `{"id": n - 1}`.
    pub fn range(n: usize) -> Self {
        Self::from_rows((0..n).map(|id| Row::new().with("id", json!(id))))
    }

    pub fn from_rows(rows: impl IntoIterator<Item = Row>) -> Self {
        Self {
            source: Arc::new(rows.into_iter().collect()),
            stages: vec![],
        }
    }

    pub(crate) fn from_shared(source: Arc<Vec<Row>>) -> Self {
        Self { source, stages: vec![] }
    }

    /// Appends a named row transformation. Nothing runs until materialization.
    pub fn map<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Row) -> Result<Row, StageError> + Send + Sync + 'static,
    {
        self.with_stage(Stage::map(name, Arc::new(f)))
    }

    pub(crate) fn with_stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Stage names in execution order.
    pub fn plan(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Number of source rows, which is also the number of output rows.
    pub fn len(&self) -> usize {
        self.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    /// Runs every stage over every row and returns the results in input order.
    ///
    /// Each call executes the full graph again; engine replicas started by an
    /// earlier call on the same runtime are reused.
    pub async fn materialize(&self, runtime: &Runtime) -> Result<MaterializedDataset, ExecutionError> {
        if runtime.is_shut_down() {
            return Err(ExecutionError::RuntimeShutDown);
        }
        info!(rows = self.source.len(), stages = self.stages.len(), "materializing dataset");

        let mut rows: Vec<Row> = self.source.as_ref().clone();
        for stage in &self.stages {
            debug!(stage = %stage.name, rows = rows.len(), "running stage");
            rows = match &stage.kind {
                StageKind::Map(f) => run_map(&stage.name, f.as_ref(), rows)?,
                StageKind::Generate { processor, config } => {
                    run_generate(runtime, &stage.name, *processor, config, rows).await?
                }
            };
        }

        Ok(MaterializedDataset::new(rows))
    }
}

impl fmt::Debug for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataset")
            .field("rows", &self.source.len())
            .field("plan", &self.plan())
            .finish()
    }
}

fn run_map(stage: &str, f: &dyn RowFn, rows: Vec<Row>) -> Result<Vec<Row>, ExecutionError> {
    rows.into_iter()
        .enumerate()
        .map(|(row, input)| {
            f.call(input).map_err(|source| ExecutionError::Stage {
                stage: stage.to_string(),
                row,
                source,
            })
        })
        .collect()
}

async fn run_generate(
    runtime: &Runtime,
    stage: &str,
    processor: Uuid,
    config: &ProcessorConfig,
    rows: Vec<Row>,
) -> Result<Vec<Row>, ExecutionError> {
    let requests = rows
        .iter()
        .enumerate()
        .map(|(row, input)| {
            ChatRequest::from_row(input).map_err(|source| ExecutionError::Stage {
                stage: stage.to_string(),
                row,
                source,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let pool = runtime.engine_pool(processor, config).await?;
    let pending = pool.submit_all(requests).await?;

    // returns at the first failed row; the pending results still queued are dropped
    let generations = try_join_all(pending.into_iter().enumerate().map(|(row, item)| async move {
        match item.await {
            Ok(Ok(generation)) => Ok(generation),
            Ok(Err(source)) => Err(ExecutionError::Inference { row, source }),
            Err(_) => Err(ExecutionError::WorkerLost(row)),
        }
    }))
    .await;

    let generations = match generations {
        Ok(generations) => generations,
        Err(err) => {
            pool.discard_abandoned().await;
            return Err(err);
        }
    };

    Ok(rows
        .into_iter()
        .zip(generations)
        .map(|(mut output, generation)| {
            generation.merge_into(&mut output);
            output
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::engine::MockEngineFactory;

    fn runtime() -> Runtime {
        Runtime::new(Arc::new(MockEngineFactory::echo()))
    }

    #[test]
    fn test_range_rows_carry_ids() {
        let dataset = Dataset::range(3);
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.source[2].get("id"), Some(&json!(2)));
        assert!(dataset.plan().is_empty());
    }

    #[test]
    fn test_map_is_lazy() {
        let dataset = Dataset::range(2).map("explode", |_row| panic!("must not run"));
        assert_eq!(dataset.plan(), vec!["explode"]);
    }

    #[tokio::test]
    async fn test_map_stages_run_in_order() {
        let dataset = Dataset::range(4)
            .map("double", |mut row| {
                let id = row.get_i64("id")?;
                row.insert("double", id * 2);
                Ok(row)
            })
            .map("plus_one", |mut row| {
                let double = row.get_i64("double")?;
                row.insert("result", double + 1);
                Ok(row)
            });

        let runtime = runtime();
        let out = dataset.materialize(&runtime).await.unwrap().take_all();

        let results: Vec<_> = out.iter().map(|r| r.get_i64("result").unwrap()).collect();
        assert_eq!(results, vec![1, 3, 5, 7]);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_stage_failure_is_attributed() {
        let dataset = Dataset::range(5).map("pick", |row| {
            if row.get_i64("id")? == 3 {
                Err(StageError::Custom("unlucky".into()))
            } else {
                Ok(row)
            }
        });

        let runtime = runtime();
        let err = dataset.materialize(&runtime).await.unwrap_err();

        assert!(matches!(
            err,
            ExecutionError::Stage { ref stage, row: 3, source: StageError::Custom(_) } if stage == "pick"
        ));
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_materialize_after_shutdown_fails() {
        let runtime = runtime();
        runtime.shutdown().await;

        let err = Dataset::range(1).materialize(&runtime).await.unwrap_err();
        assert!(matches!(err, ExecutionError::RuntimeShutDown));
    }

    #[tokio::test]
    async fn test_empty_dataset_materializes_to_nothing() {
        let runtime = runtime();
        let out = Dataset::from_rows(vec![]).map("noop", Ok).materialize(&runtime).await.unwrap();
        assert!(out.is_empty());
        runtime.shutdown().await;
    }
}
