//! # Schema Builder
//!
//! Derives a JSON-Schema descriptor from a declared record shape, for use as a
//! guided decoding constraint.
//!
//! ```rust
//! use griddle::schema::{FieldType, SchemaBuilder};
//!
//! let schema = SchemaBuilder::new("AnswerWithExplain")
//!     .field("problem", FieldType::String)
//!     .field("answer", FieldType::Integer)
//!     .field("explain", FieldType::String)
//!     .build()
//!     .unwrap();
//!
//! let ok = serde_json::json!({"problem": "3 * 6 + 5 = ?", "answer": 23, "explain": "18 + 5"});
//! assert!(schema.validate(&ok).is_ok());
//! ```
//!
//! The descriptor has the usual model-export layout:
//!
//! ```json
//! {
//!   "title": "AnswerWithExplain",
//!   "type": "object",
//!   "properties": {"answer": {"title": "Answer", "type": "integer"}, ...},
//!   "required": ["problem", "answer", "explain"],
//!   "additionalProperties": false
//! }
//! ```

use std::collections::HashSet;
use std::str::FromStr;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use strum::EnumString;
use crate::error::{SchemaDefinitionError, SchemaViolation};

/// JSON type of a declared field.
///
/// Parses from the JSON-Schema name or its common short form
/// (`"integer"` / `"int"`, `"number"` / `"float"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString)]
pub enum FieldType {
    #[strum(serialize = "string", serialize = "str")]
    String,
    #[strum(serialize = "integer", serialize = "int")]
    Integer,
    #[strum(serialize = "number", serialize = "float")]
    Number,
    #[strum(serialize = "boolean", serialize = "bool")]
    Boolean,
}

impl FieldType {
    /// Name used in the descriptor's `type` keyword.
    pub fn json_type(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
        }
    }
}

/// A declared field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    name: String,
    ty: FieldType,
}

impl Field {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> FieldType {
        self.ty
    }
}

/// Accumulates field declarations. Errors are reported by [`SchemaBuilder::build`].
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    name: String,
    fields: Vec<Field>,
    error: Option<SchemaDefinitionError>,
}

impl SchemaBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: vec![],
            error: None,
        }
    }

    /// Builds a schema from `(field, type name)` pairs.
    pub fn from_declarations<N, T>(
        name: impl Into<String>,
        declarations: &[(N, T)],
    ) -> Result<OutputSchema, SchemaDefinitionError>
    where N: AsRef<str>, T: AsRef<str>
    {
        let mut builder = Self::new(name);
        for (field, type_name) in declarations {
            let field: &str = field.as_ref();
            let type_name: &str = type_name.as_ref();
            let ty = FieldType::from_str(type_name.trim()).map_err(|_| SchemaDefinitionError::UnknownType {
                field: field.to_string(),
                type_name: type_name.to_string(),
            })?;
            builder = builder.field(field, ty);
        }
        builder.build()
    }

    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        let name = name.into();
        if self.error.is_none() {
            if !is_identifier(&name) {
                self.error = Some(SchemaDefinitionError::InvalidFieldName(name));
                return self;
            }
            if self.fields.iter().any(|f| f.name == name) {
                self.error = Some(SchemaDefinitionError::DuplicateField(name));
                return self;
            }
            self.fields.push(Field { name, ty });
        }
        self
    }

    pub fn build(self) -> Result<OutputSchema, SchemaDefinitionError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let name = self.name.trim();
        if name.is_empty() {
            return Err(SchemaDefinitionError::EmptyName);
        }
        if self.fields.is_empty() {
            return Err(SchemaDefinitionError::NoFields(name.to_string()));
        }
        Ok(OutputSchema {
            name: name.to_string(),
            fields: self.fields,
        })
    }
}

/// An immutable record schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSchema {
    name: String,
    fields: Vec<Field>,
}

impl OutputSchema {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// The JSON-Schema descriptor handed to guided decoding.
    pub fn descriptor(&self) -> Value {
        let properties: Map<String, Value> = self.fields
            .iter()
            .map(|f| {
                (f.name.clone(), json!({
                    "title": title_case(&f.name),
                    "type": f.ty.json_type(),
                }))
            })
            .collect();
        let required: Vec<&str> = self.fields.iter().map(|f| f.name.as_str()).collect();

        json!({
            "title": self.name,
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }

    /// Reads a descriptor produced by [`OutputSchema::descriptor`] back into a schema.
    ///
    /// Field order follows `required`; only scalar property types are supported.
    pub fn from_descriptor(descriptor: &Value) -> Result<Self, SchemaDefinitionError> {
        let malformed = |msg: &str| SchemaDefinitionError::MalformedDescriptor(msg.to_string());

        let object = descriptor.as_object().ok_or_else(|| malformed("descriptor is not an object"))?;
        if object.get("type").and_then(Value::as_str) != Some("object") {
            return Err(malformed("descriptor type must be `object`"));
        }
        let name = object.get("title").and_then(Value::as_str).unwrap_or("Output");
        let properties = object
            .get("properties")
            .and_then(Value::as_object)
            .ok_or_else(|| malformed("missing `properties`"))?;
        let required = object
            .get("required")
            .and_then(Value::as_array)
            .ok_or_else(|| malformed("missing `required`"))?;

        let mut builder = SchemaBuilder::new(name);
        let mut seen = HashSet::new();
        for field in required {
            let field = field.as_str().ok_or_else(|| malformed("`required` entries must be strings"))?;
            let type_name = properties
                .get(field)
                .and_then(|p| p.get("type"))
                .and_then(Value::as_str)
                .ok_or_else(|| malformed("required field without a typed property"))?;
            let ty = FieldType::from_str(type_name).map_err(|_| SchemaDefinitionError::UnknownType {
                field: field.to_string(),
                type_name: type_name.to_string(),
            })?;
            seen.insert(field);
            builder = builder.field(field, ty);
        }
        if properties.keys().any(|k| !seen.contains(k.as_str())) {
            return Err(malformed("optional properties are not supported"));
        }
        builder.build()
    }

    /// Checks that `instance` has exactly the declared fields with the declared types.
    pub fn validate(&self, instance: &Value) -> Result<(), SchemaViolation> {
        let object = instance.as_object().ok_or(SchemaViolation::NotAnObject)?;

        for field in &self.fields {
            let value = object
                .get(&field.name)
                .ok_or_else(|| SchemaViolation::MissingField(field.name.clone()))?;
            if !field.ty.accepts(value) {
                return Err(SchemaViolation::WrongType {
                    field: field.name.clone(),
                    expected: field.ty.json_type(),
                });
            }
        }

        if let Some(extra) = object.keys().find(|k| !self.fields.iter().any(|f| &f.name == *k)) {
            return Err(SchemaViolation::UnexpectedField(extra.clone()));
        }
        Ok(())
    }

    /// Parses generated text, validates it, then deserializes it as `T`.
    pub fn parse<T: DeserializeOwned>(&self, text: &str) -> Result<T, SchemaViolation> {
        let value: Value = serde_json::from_str(text).map_err(|e| SchemaViolation::InvalidJson(e.to_string()))?;
        self.validate(&value)?;
        serde_json::from_value(value).map_err(|e| SchemaViolation::InvalidJson(e.to_string()))
    }
}

/// A serde record that can describe its own output schema.
///
/// ```rust
/// use griddle::schema::{FieldType, OutputSchema, SchemaBuilder, StructuredOutput};
/// use griddle::error::SchemaDefinitionError;
///
/// #[derive(serde::Deserialize)]
/// struct Verdict { guilty: bool }
///
/// impl StructuredOutput for Verdict {
///     fn output_schema() -> Result<OutputSchema, SchemaDefinitionError> {
///         SchemaBuilder::new("Verdict").field("guilty", FieldType::Boolean).build()
///     }
/// }
///
/// let verdict = Verdict::from_generated(r#"{"guilty": false}"#).unwrap();
/// assert!(!verdict.guilty);
/// ```
pub trait StructuredOutput: DeserializeOwned {
    fn output_schema() -> Result<OutputSchema, SchemaDefinitionError>;

    /// Validates and parses a generated JSON document.
    fn from_generated(text: &str) -> Result<Self, crate::error::Error>
    where Self: Sized
    {
        let schema = Self::output_schema()?;
        Ok(schema.parse(text)?)
    }
}

/// Checks a generated string against a guided decoding descriptor.
pub(crate) fn check_json_constraint(descriptor: &Value, text: &str) -> Result<(), SchemaViolation> {
    let instance: Value = serde_json::from_str(text).map_err(|e| SchemaViolation::InvalidJson(e.to_string()))?;
    match OutputSchema::from_descriptor(descriptor) {
        Ok(schema) => schema.validate(&instance),
        // Descriptors we cannot interpret are left to the engine.
        Err(_) => Ok(()),
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `max_model_len` -> `Max Model Len`
fn title_case(name: &str) -> String {
    name.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
