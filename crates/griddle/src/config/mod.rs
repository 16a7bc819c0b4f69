//! # Processor Configuration
//!
//! [`ProcessorConfig`] describes one inference stage: which model to serve,
//! how to tune the engine, how many rows go into one engine call
//! (`batch_size`) and how many engine replicas process the dataset in
//! parallel (`concurrency`). It is built once and read-only afterwards.
//!
//! Two ways to construct one:
//!
//! * programmatically, through [`ProcessorConfig::builder`];
//! * from layered settings (defaults, then an optional TOML file, then
//!   `GRIDDLE_` environment variables) through [`ProcessorConfig::from_settings`].
//!
//! ```toml
//! model_source = "unsloth/Llama-3.2-1B-Instruct"
//! batch_size = 16
//! concurrency = 1
//!
//! [engine_kwargs]
//! guided_decoding_backend = "xgrammar"
//! dtype = "half"
//! max_model_len = 1024
//! ```
//!
//! Nested keys are split on `__` in the environment, e.g.
//! `GRIDDLE_ENGINE_KWARGS__MAX_MODEL_LEN=2048`.

mod engine_options;

use std::collections::BTreeMap;
use std::path::Path;
use derive_builder::Builder;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::error::ConfigurationError;

pub use engine_options::*;

pub const ENV_PREFIX: &str = "GRIDDLE_";
pub const DEFAULT_BATCH_SIZE: usize = 64;
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Configuration of one inference stage.
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(
    pattern = "owned",
    build_fn(validate = "Self::validate", error = "ConfigurationError")
)]
pub struct ProcessorConfig {
    /// Model identifier understood by the engine (hub id or local path).
    #[builder(setter(into))]
    model_source: String,

    #[builder(default, setter(custom))]
    engine_options: EngineOptions,

    /// Rows per engine call.
    #[builder(default = "DEFAULT_BATCH_SIZE")]
    batch_size: usize,

    /// Engine replicas working on the dataset.
    #[builder(default = "DEFAULT_CONCURRENCY")]
    concurrency: usize,
}

impl ProcessorConfig {
    pub fn builder() -> ProcessorConfigBuilder {
        ProcessorConfigBuilder::default()
    }

    pub fn model_source(&self) -> &str {
        &self.model_source
    }

    pub fn engine_options(&self) -> &EngineOptions {
        &self.engine_options
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Layered settings sources, lowest priority first.
    pub fn figment(path: Option<&Path>) -> Figment {
        Self::figment_over(ProcessorSettings::default(), path)
    }

    /// Like [`ProcessorConfig::figment`], with `defaults` as the bottom layer.
    pub fn figment_over(defaults: ProcessorSettings, path: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(defaults));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Loads and validates the configuration from [`ProcessorConfig::figment`].
    pub fn from_settings(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        Self::from_settings_over(ProcessorSettings::default(), path)
    }

    /// Loads the file and environment on top of `defaults`, then validates.
    pub fn from_settings_over(defaults: ProcessorSettings, path: Option<&Path>) -> Result<Self, ConfigurationError> {
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigurationError::SettingsFileNotFound(path.to_path_buf()));
            }
        }
        let settings: ProcessorSettings = Self::figment_over(defaults, path).extract()?;
        Self::try_from(settings)
    }

    /// The untyped view, e.g. for logging or re-serialization.
    pub fn to_settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            model_source: self.model_source.clone(),
            engine_kwargs: self.engine_options.to_kwargs().into_iter().collect(),
            batch_size: self.batch_size,
            concurrency: self.concurrency,
        }
    }
}

impl ProcessorConfigBuilder {
    /// Replaces all engine options.
    pub fn engine_options(mut self, options: EngineOptions) -> Self {
        self.engine_options = Some(options);
        self
    }

    /// Adds a single engine option.
    pub fn engine_option(mut self, option: EngineOption) -> Self {
        self.engine_options.get_or_insert_with(EngineOptions::default).insert(option);
        self
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        match self.model_source.as_deref() {
            Some(source) if !source.trim().is_empty() => {}
            _ => return Err(ConfigurationError::EmptyModelSource),
        }
        if self.batch_size == Some(0) {
            return Err(ConfigurationError::NonPositive("batch_size"));
        }
        if self.concurrency == Some(0) {
            return Err(ConfigurationError::NonPositive("concurrency"));
        }
        Ok(())
    }
}

/// Serialized form of [`ProcessorConfig`], with engine options as an untyped map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorSettings {
    pub model_source: String,
    #[serde(default)]
    pub engine_kwargs: BTreeMap<String, Value>,
    pub batch_size: usize,
    pub concurrency: usize,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            model_source: String::new(),
            engine_kwargs: BTreeMap::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl TryFrom<ProcessorSettings> for ProcessorConfig {
    type Error = ConfigurationError;

    fn try_from(settings: ProcessorSettings) -> Result<Self, Self::Error> {
        ProcessorConfig::builder()
            .model_source(settings.model_source)
            .engine_options(EngineOptions::from_kwargs(settings.engine_kwargs)?)
            .batch_size(settings.batch_size)
            .concurrency(settings.concurrency)
            .build()
    }
}
