//! # Errors
//!
//! One error type per pipeline phase, so a caller can tell *when* a run went
//! wrong from the type alone:
//!
//! | Phase | Error |
//! |-------|-------|
//! | declaring the output shape | [`SchemaDefinitionError`] |
//! | building the processor configuration | [`ConfigurationError`] |
//! | binding row functions into a processor | [`BindingError`] |
//! | materializing a dataset | [`ExecutionError`] |
//!
//! [`ExecutionError`] wraps the lower level [`StageError`] (raised by row
//! functions) and [`EngineError`] (raised by the inference collaborator).
//! [`Error`] unifies all of them for callers that only need to propagate.

use std::time::Duration;
use thiserror::Error;

/// A malformed structured-output declaration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaDefinitionError {
    #[error("schema name must not be empty")]
    EmptyName,

    #[error("schema `{0}` declares no fields")]
    NoFields(String),

    #[error("invalid field name `{0}`: expected an identifier")]
    InvalidFieldName(String),

    #[error("field `{0}` is declared more than once")]
    DuplicateField(String),

    #[error("field `{field}` has unknown type `{type_name}`")]
    UnknownType { field: String, type_name: String },

    #[error("malformed schema descriptor: {0}")]
    MalformedDescriptor(String),
}

/// A generated instance that does not conform to an [`crate::schema::OutputSchema`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaViolation {
    #[error("generated text is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("expected a JSON object")]
    NotAnObject,

    #[error("missing required field `{0}`")]
    MissingField(String),

    #[error("unexpected field `{0}`")]
    UnexpectedField(String),

    #[error("field `{field}` must be of type {expected}")]
    WrongType { field: String, expected: &'static str },

    #[error("`{0}` is not one of the allowed choices")]
    NotAChoice(String),
}

/// An invalid processor configuration. Raised before anything executes.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("model source must not be empty")]
    EmptyModelSource,

    #[error("`{0}` must be a positive integer")]
    NonPositive(&'static str),

    #[error("unrecognized engine option `{0}`")]
    UnknownEngineOption(String),

    #[error("invalid value for engine option `{key}`: {reason}")]
    InvalidEngineOption { key: String, reason: String },

    #[error("missing configuration field `{0}`")]
    MissingField(String),

    #[error("settings file `{0}` does not exist")]
    SettingsFileNotFound(std::path::PathBuf),

    #[error("unable to load settings")]
    Settings(#[from] Box<figment::Error>),
}

impl From<derive_builder::UninitializedFieldError> for ConfigurationError {
    fn from(err: derive_builder::UninitializedFieldError) -> Self {
        ConfigurationError::MissingField(err.field_name().to_string())
    }
}

impl From<figment::Error> for ConfigurationError {
    fn from(err: figment::Error) -> Self {
        ConfigurationError::Settings(Box::new(err))
    }
}

/// Row functions could not be bound into a processor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingError {
    #[error("a preprocess function is required to build inference requests")]
    MissingPreprocess,

    #[error("the {0} function was bound more than once")]
    AlreadyBound(&'static str),

    #[error("preprocess does not produce an inference request row: {0}")]
    IncompatiblePreprocess(String),
}

/// Failure raised by a row function, or by the conversion of a row into an
/// inference request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error("row is missing field `{0}`")]
    MissingField(String),

    #[error("field `{field}` must be {expected}")]
    FieldType { field: String, expected: &'static str },

    #[error("row is not a valid inference request: {0}")]
    MalformedRequest(String),

    #[error("{0}")]
    Custom(String),
}

/// Failure surfaced by the inference collaborator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("inference timed out after {0:?}")]
    Timeout(Duration),

    #[error("engine resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("malformed generation: {0}")]
    MalformedGeneration(String),

    #[error("generation violates the guided decoding schema")]
    SchemaViolation(#[from] SchemaViolation),

    #[error("engine returned {actual} generations for a batch of {expected}")]
    BatchSizeMismatch { expected: usize, actual: usize },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("engine was shut down before the request completed")]
    ShutDown,

    #[error("{0}")]
    Other(String),
}

/// Materialization failed. No partial results are returned.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("stage `{stage}` failed on row {row}")]
    Stage {
        stage: String,
        row: usize,
        #[source]
        source: StageError,
    },

    #[error("inference failed on row {row}")]
    Inference {
        row: usize,
        #[source]
        source: EngineError,
    },

    #[error("unable to start engine replica {replica}")]
    EngineStartup {
        replica: usize,
        #[source]
        source: EngineError,
    },

    #[error("inference worker dropped row {0} without a result")]
    WorkerLost(usize),

    #[error("the runtime has been shut down")]
    RuntimeShutDown,
}

/// Any error raised while configuring or running a pipeline.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    SchemaDefinition(#[from] SchemaDefinitionError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    SchemaViolation(#[from] SchemaViolation),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
