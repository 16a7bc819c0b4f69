//! Engine tuning options.
//!
//! The serving engine takes an open-ended keyword map. Here each accepted key
//! is an [`EngineOptionKey`] and each value is checked when it is parsed, so a
//! misspelled key or a mistyped value fails when the configuration is built
//! rather than when the engine starts.

use std::collections::BTreeMap;
use std::str::FromStr;
use serde_json::{Map, Value};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoStaticStr};
use crate::error::ConfigurationError;

/// Keys accepted in the engine keyword map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, AsRefStr, EnumString, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum EngineOptionKey {
    GuidedDecodingBackend,
    Dtype,
    MaxModelLen,
    GpuMemoryUtilization,
    TensorParallelSize,
    PipelineParallelSize,
    MaxNumSeqs,
    MaxNumBatchedTokens,
    EnforceEager,
    EnableChunkedPrefill,
    EnablePrefixCaching,
    TrustRemoteCode,
    Seed,
}

/// Library that compiles guided decoding constraints inside the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, AsRefStr, EnumString)]
pub enum GuidedDecodingBackend {
    #[default]
    #[strum(serialize = "xgrammar")]
    Xgrammar,
    #[strum(serialize = "outlines")]
    Outlines,
    #[strum(serialize = "lm-format-enforcer")]
    LmFormatEnforcer,
    #[strum(serialize = "guidance")]
    Guidance,
    #[strum(serialize = "auto")]
    Auto,
}

/// Weight and activation precision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Dtype {
    #[default]
    Auto,
    Half,
    Float16,
    Bfloat16,
    Float,
    Float32,
}

/// A validated engine option.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineOption {
    /// Guided decoding library. Defaults to `xgrammar` when unset.
    GuidedDecodingBackend(GuidedDecodingBackend),
    /// Precision. Older GPUs (e.g. T4) have no bfloat16 support and need `half`.
    Dtype(Dtype),
    /// Context length. Lower it to fit the KV cache on small GPUs.
    MaxModelLen(u32),
    /// Fraction of GPU memory the engine may claim, in `(0, 1]`.
    GpuMemoryUtilization(f64),
    TensorParallelSize(u32),
    PipelineParallelSize(u32),
    /// Upper bound on sequences scheduled per engine step.
    MaxNumSeqs(u32),
    MaxNumBatchedTokens(u32),
    /// Disable CUDA graph capture.
    EnforceEager(bool),
    EnableChunkedPrefill(bool),
    EnablePrefixCaching(bool),
    TrustRemoteCode(bool),
    Seed(u64),
}

impl EngineOption {
    pub fn key(&self) -> EngineOptionKey {
        match self {
            EngineOption::GuidedDecodingBackend(_) => EngineOptionKey::GuidedDecodingBackend,
            EngineOption::Dtype(_) => EngineOptionKey::Dtype,
            EngineOption::MaxModelLen(_) => EngineOptionKey::MaxModelLen,
            EngineOption::GpuMemoryUtilization(_) => EngineOptionKey::GpuMemoryUtilization,
            EngineOption::TensorParallelSize(_) => EngineOptionKey::TensorParallelSize,
            EngineOption::PipelineParallelSize(_) => EngineOptionKey::PipelineParallelSize,
            EngineOption::MaxNumSeqs(_) => EngineOptionKey::MaxNumSeqs,
            EngineOption::MaxNumBatchedTokens(_) => EngineOptionKey::MaxNumBatchedTokens,
            EngineOption::EnforceEager(_) => EngineOptionKey::EnforceEager,
            EngineOption::EnableChunkedPrefill(_) => EngineOptionKey::EnableChunkedPrefill,
            EngineOption::EnablePrefixCaching(_) => EngineOptionKey::EnablePrefixCaching,
            EngineOption::TrustRemoteCode(_) => EngineOptionKey::TrustRemoteCode,
            EngineOption::Seed(_) => EngineOptionKey::Seed,
        }
    }

    /// The value as the engine expects it in its keyword map.
    pub fn to_value(&self) -> Value {
        match self {
            EngineOption::GuidedDecodingBackend(backend) => Value::from(backend.as_ref()),
            EngineOption::Dtype(dtype) => Value::from(dtype.as_ref()),
            EngineOption::MaxModelLen(v)
            | EngineOption::TensorParallelSize(v)
            | EngineOption::PipelineParallelSize(v)
            | EngineOption::MaxNumSeqs(v)
            | EngineOption::MaxNumBatchedTokens(v) => Value::from(*v),
            EngineOption::GpuMemoryUtilization(v) => Value::from(*v),
            EngineOption::EnforceEager(v)
            | EngineOption::EnableChunkedPrefill(v)
            | EngineOption::EnablePrefixCaching(v)
            | EngineOption::TrustRemoteCode(v) => Value::from(*v),
            EngineOption::Seed(v) => Value::from(*v),
        }
    }

    /// Parses an untyped `key = value` pair.
    pub fn parse(key: &str, value: &Value) -> Result<Self, ConfigurationError> {
        let parsed_key = EngineOptionKey::from_str(key)
            .map_err(|_| ConfigurationError::UnknownEngineOption(key.to_string()))?;

        let option = match parsed_key {
            EngineOptionKey::GuidedDecodingBackend => EngineOption::GuidedDecodingBackend(enum_value(key, value)?),
            EngineOptionKey::Dtype => EngineOption::Dtype(enum_value(key, value)?),
            EngineOptionKey::MaxModelLen => EngineOption::MaxModelLen(positive(key, value)?),
            EngineOptionKey::GpuMemoryUtilization => {
                let fraction = number(key, value)?;
                if !(fraction > 0.0 && fraction <= 1.0) {
                    return Err(invalid(key, "expected a fraction in (0, 1]"));
                }
                EngineOption::GpuMemoryUtilization(fraction)
            }
            EngineOptionKey::TensorParallelSize => EngineOption::TensorParallelSize(positive(key, value)?),
            EngineOptionKey::PipelineParallelSize => EngineOption::PipelineParallelSize(positive(key, value)?),
            EngineOptionKey::MaxNumSeqs => EngineOption::MaxNumSeqs(positive(key, value)?),
            EngineOptionKey::MaxNumBatchedTokens => EngineOption::MaxNumBatchedTokens(positive(key, value)?),
            EngineOptionKey::EnforceEager => EngineOption::EnforceEager(boolean(key, value)?),
            EngineOptionKey::EnableChunkedPrefill => EngineOption::EnableChunkedPrefill(boolean(key, value)?),
            EngineOptionKey::EnablePrefixCaching => EngineOption::EnablePrefixCaching(boolean(key, value)?),
            EngineOptionKey::TrustRemoteCode => EngineOption::TrustRemoteCode(boolean(key, value)?),
            EngineOptionKey::Seed => EngineOption::Seed(unsigned(key, value)?),
        };
        Ok(option)
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigurationError {
    ConfigurationError::InvalidEngineOption {
        key: key.to_string(),
        reason: reason.into(),
    }
}

// Environment sourced settings may carry scalars as strings, so strings are
// accepted wherever they parse.

fn enum_value<T: FromStr>(key: &str, value: &Value) -> Result<T, ConfigurationError> {
    let text = value.as_str().ok_or_else(|| invalid(key, "expected a string"))?;
    T::from_str(text).map_err(|_| invalid(key, format!("unsupported value `{text}`")))
}

fn unsigned(key: &str, value: &Value) -> Result<u64, ConfigurationError> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| invalid(key, "expected a non-negative integer"))
}

fn positive(key: &str, value: &Value) -> Result<u32, ConfigurationError> {
    let n = unsigned(key, value)?;
    match u32::try_from(n) {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(invalid(key, "expected a positive 32-bit integer")),
    }
}

fn number(key: &str, value: &Value) -> Result<f64, ConfigurationError> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| invalid(key, "expected a number"))
}

fn boolean(key: &str, value: &Value) -> Result<bool, ConfigurationError> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| invalid(key, "expected a boolean"))
}

/// The validated engine keyword map. At most one value per key; later inserts win.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineOptions {
    options: BTreeMap<EngineOptionKey, EngineOption>,
}

impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses an untyped keyword map, rejecting unknown keys and bad values.
    pub fn from_kwargs<K, I>(kwargs: I) -> Result<Self, ConfigurationError>
    where
        K: AsRef<str>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let mut options = Self::new();
        for (key, value) in kwargs {
            options.insert(EngineOption::parse(key.as_ref(), &value)?);
        }
        Ok(options)
    }

    pub fn with(mut self, option: EngineOption) -> Self {
        self.insert(option);
        self
    }

    pub fn insert(&mut self, option: EngineOption) -> Option<EngineOption> {
        self.options.insert(option.key(), option)
    }

    pub fn get(&self, key: EngineOptionKey) -> Option<&EngineOption> {
        self.options.get(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EngineOption> {
        self.options.values()
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// The configured guided decoding backend, or the engine default.
    pub fn guided_decoding_backend(&self) -> GuidedDecodingBackend {
        match self.get(EngineOptionKey::GuidedDecodingBackend) {
            Some(EngineOption::GuidedDecodingBackend(backend)) => *backend,
            _ => GuidedDecodingBackend::default(),
        }
    }

    /// Keyword map handed to the engine.
    pub fn to_kwargs(&self) -> Map<String, Value> {
        self.options
            .iter()
            .map(|(key, option)| (key.to_string(), option.to_value()))
            .collect()
    }
}
