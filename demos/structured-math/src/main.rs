mod pipeline;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use clap::{Parser, ValueEnum};
use griddle::engine::{EngineFactory, MockEngineFactory, OpenAiEngineFactory, DEFAULT_BASE_URL};
use griddle::{
    build_llm_processor, Dataset, Dtype, EngineOption, GuidedDecodingBackend, ProcessorConfig,
    ProcessorSettings, Runtime, StructuredOutput,
};
use tracing::info;
use crate::pipeline::{postprocess, preprocess, solve, AnswerWithExplain};

const DEFAULT_MODEL: &str = "unsloth/Llama-3.2-1B-Instruct";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EngineKind {
    /// Solve the equations in process, no model needed
    Mock,
    /// Call an OpenAI-compatible server, e.g. `vllm serve`
    Openai,
}

/// Ask a model to solve `3 * id + 5` for a range of ids, with JSON-constrained answers.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Number of rows (ids 0..rows)
    #[arg(long, default_value_t = 30)]
    rows: usize,

    /// TOML settings file; GRIDDLE_* environment variables override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model identifier, overrides the settings
    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    concurrency: Option<usize>,

    #[arg(long, value_enum, default_value_t = EngineKind::Mock)]
    engine: EngineKind,

    /// Base URL of the OpenAI-compatible server
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Per-request HTTP timeout
    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

impl Args {
    /// Demo defaults, then the settings file, then `GRIDDLE_*` variables,
    /// then command line flags.
    fn processor_config(&self) -> anyhow::Result<ProcessorConfig> {
        let settings = ProcessorConfig::from_settings_over(demo_settings()?, self.config.as_deref())
            .with_context(|| match &self.config {
                Some(path) => format!("loading {}", path.display()),
                None => "loading settings from the environment".to_string(),
            })?;

        let mut builder = ProcessorConfig::builder()
            .model_source(settings.model_source())
            .engine_options(settings.engine_options().clone())
            .batch_size(settings.batch_size())
            .concurrency(settings.concurrency());
        if let Some(model) = &self.model {
            builder = builder.model_source(model.as_str());
        }
        if let Some(batch_size) = self.batch_size {
            builder = builder.batch_size(batch_size);
        }
        if let Some(concurrency) = self.concurrency {
            builder = builder.concurrency(concurrency);
        }
        Ok(builder.build()?)
    }

    fn engine_factory(&self) -> Arc<dyn EngineFactory> {
        match self.engine {
            EngineKind::Mock => Arc::new(MockEngineFactory::new(solve)),
            EngineKind::Openai => {
                let mut factory = OpenAiEngineFactory::new(self.base_url.as_str())
                    .with_timeout(Duration::from_secs(self.timeout_secs));
                if let Some(key) = &self.api_key {
                    factory = factory.with_api_key(key.as_str());
                }
                Arc::new(factory)
            }
        }
    }
}

fn demo_settings() -> Result<ProcessorSettings, griddle::ConfigurationError> {
    let config = ProcessorConfig::builder()
        .model_source(DEFAULT_MODEL)
        .engine_option(EngineOption::GuidedDecodingBackend(GuidedDecodingBackend::Xgrammar))
        .engine_option(EngineOption::Dtype(Dtype::Half))
        .engine_option(EngineOption::MaxModelLen(1024))
        .batch_size(16)
        .concurrency(1)
        .build()?;
    Ok(config.to_settings())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    griddle::logging::init();
    let args = Args::parse();

    let config = args.processor_config()?;
    info!(
        model = config.model_source(),
        batch_size = config.batch_size(),
        concurrency = config.concurrency(),
        engine = ?args.engine,
        "configured"
    );

    let schema = AnswerWithExplain::output_schema()?;
    let processor = build_llm_processor(config, preprocess(schema), postprocess)?;
    let dataset = processor.apply(Dataset::range(args.rows));

    let rows = Runtime::scoped(args.engine_factory(), |runtime| async move {
        dataset.materialize(&runtime).await
    })
    .await?;

    for row in rows.take_all() {
        println!("{}", row.get_str("resp")?);
        println!("{}", "=".repeat(10));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_match_demo_settings() {
        Jail::expect_with(|_jail| {
            let args = Args::parse_from(["structured-math"]);
            let config = args.processor_config().map_err(|e| e.to_string())?;

            assert_eq!(args.rows, 30);
            assert_eq!(config.model_source(), DEFAULT_MODEL);
            assert_eq!(config.batch_size(), 16);
            assert_eq!(config.concurrency(), 1);
            assert_eq!(config.engine_options().len(), 3);
            Ok(())
        });
    }

    #[test]
    fn test_environment_overrides_demo_defaults() {
        Jail::expect_with(|jail| {
            jail.set_env("GRIDDLE_BATCH_SIZE", 3);
            jail.set_env("GRIDDLE_MODEL_SOURCE", "local/model");

            let config = Args::parse_from(["structured-math"]).processor_config().map_err(|e| e.to_string())?;

            assert_eq!(config.batch_size(), 3);
            assert_eq!(config.model_source(), "local/model");
            assert_eq!(config.engine_options().len(), 3);
            Ok(())
        });
    }

    #[test]
    fn test_settings_file_sits_between_defaults_and_environment() {
        Jail::expect_with(|jail| {
            jail.create_file("math.toml", "batch_size = 8\nconcurrency = 2\n")?;
            jail.set_env("GRIDDLE_CONCURRENCY", 4);

            let config = Args::parse_from(["structured-math", "--config", "math.toml"])
                .processor_config()
                .map_err(|e| e.to_string())?;

            assert_eq!(config.model_source(), DEFAULT_MODEL);
            assert_eq!(config.batch_size(), 8);
            assert_eq!(config.concurrency(), 4);
            Ok(())
        });
    }

    #[test]
    fn test_flags_override_settings() {
        Jail::expect_with(|jail| {
            jail.set_env("GRIDDLE_BATCH_SIZE", 3);
            let args = Args::parse_from(["structured-math", "--model", "other", "--batch-size", "4", "--concurrency", "2"]);
            let config = args.processor_config().map_err(|e| e.to_string())?;

            assert_eq!(config.model_source(), "other");
            assert_eq!(config.batch_size(), 4);
            assert_eq!(config.concurrency(), 2);
            Ok(())
        });
    }

    #[test]
    fn test_blank_model_flag_is_a_configuration_error() {
        Jail::expect_with(|_jail| {
            let args = Args::parse_from(["structured-math", "--model", " "]);
            let err = args.processor_config().unwrap_err();

            assert!(err.downcast_ref::<griddle::ConfigurationError>().is_some());
            Ok(())
        });
    }

    #[tokio::test]
    async fn test_mock_run_answers_every_row() {
        let args = Args::parse_from(["structured-math", "--rows", "7", "--concurrency", "2", "--batch-size", "16"]);
        let processor = build_llm_processor(
            args.processor_config().unwrap(),
            preprocess(AnswerWithExplain::output_schema().unwrap()),
            postprocess,
        )
        .unwrap();
        let dataset = processor.apply(Dataset::range(args.rows));

        let rows = Runtime::scoped(args.engine_factory(), |runtime| async move {
            dataset.materialize(&runtime).await
        })
        .await
        .unwrap();

        let answers: Vec<i64> = rows
            .iter()
            .map(|row| AnswerWithExplain::from_generated(row.get_str("resp").unwrap()).unwrap().answer)
            .collect();
        assert_eq!(answers, (0..7).map(|id| 3 * id + 5).collect::<Vec<_>>());
    }
}
