//! # Row and request types
//!
//! A [`Row`] is the unit that flows through a dataset. Rows are untyped JSON
//! objects so that row functions can add and drop columns freely; the typed
//! [`ChatRequest`] and [`Generation`] views are only used at the boundary with
//! the inference collaborator.
//!
//! Column names used by the generate stage:
//!
//! | Column | Written by | Shape |
//! |--------|-----------|-------|
//! | `messages` | preprocess | `[{role, content}]` |
//! | `sampling_params` | preprocess | [`SamplingParams`] |
//! | `generated_text` | generate | string |
//! | `num_generated_tokens` | generate | integer |
//! | `finish_reason` | generate | `"stop"` or `"length"` |

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{AsRefStr, Display};
use crate::error::StageError;

pub const MESSAGES: &str = "messages";
pub const SAMPLING_PARAMS: &str = "sampling_params";
pub const GENERATED_TEXT: &str = "generated_text";
pub const NUM_GENERATED_TOKENS: &str = "num_generated_tokens";
pub const FINISH_REASON: &str = "finish_reason";

/// A single dataset row: a mapping from column name to JSON value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(Map<String, Value>);

impl Row {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style insert, handy for literal rows.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(column, value);
        self
    }

    /// Converts a JSON value into a row. Only objects are rows.
    pub fn from_value(value: Value) -> Result<Self, StageError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(StageError::Custom(format!("expected a JSON object row, found {other}"))),
        }
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(column.into(), value.into())
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        self.0.remove(column)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the value of `column`, failing with [`StageError::MissingField`]
    /// rather than defaulting when the column is absent.
    pub fn require(&self, column: &str) -> Result<&Value, StageError> {
        self.0
            .get(column)
            .ok_or_else(|| StageError::MissingField(column.to_string()))
    }

    /// Removes and returns `column`, failing when it is absent.
    pub fn take(&mut self, column: &str) -> Result<Value, StageError> {
        self.0
            .remove(column)
            .ok_or_else(|| StageError::MissingField(column.to_string()))
    }

    pub fn get_i64(&self, column: &str) -> Result<i64, StageError> {
        self.require(column)?
            .as_i64()
            .ok_or_else(|| StageError::FieldType { field: column.to_string(), expected: "an integer" })
    }

    pub fn get_str(&self, column: &str) -> Result<&str, StageError> {
        self.require(column)?
            .as_str()
            .ok_or_else(|| StageError::FieldType { field: column.to_string(), expected: "a string" })
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Row {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Row> for Value {
    fn from(row: Row) -> Self {
        Value::Object(row.0)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn of an OpenAI-style chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Constraint applied to generation by the engine's guided decoding backend.
///
/// Serialized externally tagged, e.g. `{"json": {...}}` or `{"choice": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuidedDecoding {
    /// A JSON-Schema descriptor the output must conform to.
    Json(Value),
    /// The output must be exactly one of these strings.
    Choice(Vec<String>),
    /// An EBNF grammar, compiled by the engine.
    Grammar(String),
    /// A regular expression, compiled by the engine.
    Regex(String),
}

impl GuidedDecoding {
    pub fn json(schema: &crate::schema::OutputSchema) -> Self {
        GuidedDecoding::Json(schema.descriptor())
    }
}

fn default_temperature() -> f32 {
    1.0
}

fn default_detokenize() -> bool {
    true
}

/// Per-request sampling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    #[serde(default = "default_detokenize")]
    pub detokenize: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guided_decoding: Option<GuidedDecoding>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: None,
            top_p: None,
            seed: None,
            detokenize: default_detokenize(),
            guided_decoding: None,
        }
    }
}

/// The request view of a preprocessed row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub sampling_params: SamplingParams,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>, sampling_params: SamplingParams) -> Self {
        Self { messages, sampling_params }
    }

    /// Reads the request columns of a preprocessed row. Other columns are ignored.
    pub fn from_row(row: &Row) -> Result<Self, StageError> {
        let messages = row.require(MESSAGES)?.clone();
        let messages: Vec<ChatMessage> = serde_json::from_value(messages)
            .map_err(|e| StageError::MalformedRequest(format!("{MESSAGES}: {e}")))?;
        if messages.is_empty() {
            return Err(StageError::MalformedRequest(format!("{MESSAGES} must not be empty")));
        }

        let sampling_params = match row.get(SAMPLING_PARAMS) {
            None | Some(Value::Null) => SamplingParams::default(),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| StageError::MalformedRequest(format!("{SAMPLING_PARAMS}: {e}")))?,
        };

        Ok(Self { messages, sampling_params })
    }

    /// Writes the request as a preprocessed row.
    pub fn into_row(self) -> Result<Row, StageError> {
        let messages = serde_json::to_value(self.messages)
            .map_err(|e| StageError::MalformedRequest(format!("{MESSAGES}: {e}")))?;
        let sampling_params = serde_json::to_value(self.sampling_params)
            .map_err(|e| StageError::MalformedRequest(format!("{SAMPLING_PARAMS}: {e}")))?;
        Ok(Row::new().with(MESSAGES, messages).with(SAMPLING_PARAMS, sampling_params))
    }

    /// Content of the last user turn, if any.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FinishReason {
    Stop,
    Length,
}

/// What the inference collaborator returns for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub generated_text: String,
    pub num_generated_tokens: usize,
    pub finish_reason: FinishReason,
}

impl Generation {
    /// Adds the generation columns to `row`.
    pub fn merge_into(self, row: &mut Row) {
        row.insert(GENERATED_TEXT, self.generated_text);
        row.insert(NUM_GENERATED_TOKENS, self.num_generated_tokens);
        row.insert(FINISH_REASON, self.finish_reason.as_ref());
    }
}
