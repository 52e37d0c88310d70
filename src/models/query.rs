//! Statement-related data models.
//!
//! This module defines bound parameter values, decoded rows, and the typed
//! result of an insert that returns generated columns.

use crate::models::DatabaseType;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A value bound to a statement placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// NULL value
    Null,
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    Float(f64),
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    Json(JsonValue),
}

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this value for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// One result row, columns kept in the order the database returned them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<JsonValue>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<JsonValue>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[JsonValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value of the named column.
    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|idx| self.values.get(idx))
    }

    pub fn get_index(&self, idx: usize) -> Option<&JsonValue> {
        self.values.get(idx)
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(JsonValue::as_i64)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(JsonValue::as_str)
    }

    pub fn into_map(self) -> serde_json::Map<String, JsonValue> {
        self.columns.into_iter().zip(self.values).collect()
    }
}

/// A database column filled in by the database on insert, and the model
/// attribute it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedField {
    pub column: String,
    pub attribute: String,
}

/// Ordered list of generated columns supplied by the model layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratedFields {
    fields: Vec<GeneratedField>,
}

impl GeneratedFields {
    pub fn new<I, C, A>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (C, A)>,
        C: Into<String>,
        A: Into<String>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(column, attribute)| GeneratedField {
                    column: column.into(),
                    attribute: attribute.into(),
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[GeneratedField] {
        &self.fields
    }

    /// ` RETURNING a, b` suffix for the insert statement, when the dialect
    /// supports it and there is anything to return.
    pub fn returning_clause(&self, dialect: DatabaseType) -> Option<String> {
        if self.fields.is_empty() || !dialect.supports_returning() {
            return None;
        }
        let columns: Vec<String> = self
            .fields
            .iter()
            .map(|f| dialect.quote_identifier(&f.column))
            .collect();
        Some(format!(" RETURNING {}", columns.join(", ")))
    }

    /// Map the returned row onto attributes by position.
    pub fn populate(&self, row: Option<&Row>) -> InsertResult {
        let values = match row {
            Some(row) => self
                .fields
                .iter()
                .zip(row.values())
                .map(|(field, value)| (field.attribute.clone(), value.clone()))
                .collect(),
            None => Vec::new(),
        };
        InsertResult { values }
    }
}

/// Generated values produced by an insert, keyed by model attribute.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InsertResult {
    values: Vec<(String, JsonValue)>,
}

impl InsertResult {
    pub fn get(&self, attribute: &str) -> Option<&JsonValue> {
        self.values
            .iter()
            .find(|(name, _)| name == attribute)
            .map(|(_, value)| value)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &JsonValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }
}
