//! The message envelope exchanged with clients.
//!
//! On the wire a message is a single JSON object per frame. The `type` field is the
//! discriminator; every other field is payload. In memory the two are kept apart so that a
//! payload can never silently overwrite the discriminator.

use serde_json::{Map, Value};
use thiserror::Error;

/// Key reserved for the message discriminator.
pub const TYPE_KEY: &str = "type";

/// Errors produced while parsing, encoding or reading a message.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("frame is not a JSON object: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no 'type' field")]
    MissingType,

    #[error("'type' field is not a string")]
    TypeNotString,

    #[error("payload defines reserved key 'type' ({0})")]
    ReservedKey(Value),

    #[error("key '{0}' does not exist")]
    MissingField(String),

    #[error("cannot read '{key}' as {expected}")]
    WrongType { key: String, expected: &'static str },
}

/// An immutable, typed envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    kind: String,
    payload: Map<String, Value>,
}

impl Message {
    /// Creates a message of the given type with an empty payload.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Map::new(),
        }
    }

    /// Adds a payload field and returns the message for chaining.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.payload.insert(key.into(), value.into());
    }

    /// The `type` discriminator.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Parses one text frame.
    ///
    /// The frame must be a JSON object with a string `type` field; the remaining fields
    /// become the payload.
    pub fn parse(frame: &str) -> Result<Self, MessageError> {
        let parsed: Value = serde_json::from_str(frame)?;

        let Value::Object(mut payload) = parsed else {
            return Err(MessageError::NotAnObject);
        };

        let kind = match payload.remove(TYPE_KEY) {
            Some(Value::String(kind)) => kind,
            Some(_) => return Err(MessageError::TypeNotString),
            None => return Err(MessageError::MissingType),
        };

        Ok(Self { kind, payload })
    }

    /// Encodes the message into a text frame.
    ///
    /// Fails if the payload itself defines `type`.
    pub fn encode(&self) -> Result<String, MessageError> {
        if let Some(existing) = self.payload.get(TYPE_KEY) {
            return Err(MessageError::ReservedKey(existing.clone()));
        }

        let mut object = Map::with_capacity(self.payload.len() + 1);
        object.insert(TYPE_KEY.to_string(), Value::String(self.kind.clone()));

        for (key, value) in &self.payload {
            object.insert(key.clone(), value.clone());
        }

        Ok(serde_json::to_string(&Value::Object(object))?)
    }

    /// Returns the raw value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    fn require(&self, key: &str) -> Result<&Value, MessageError> {
        self.get(key)
            .ok_or_else(|| MessageError::MissingField(key.to_string()))
    }

    pub fn get_str(&self, key: &str) -> Result<&str, MessageError> {
        self.require(key)?
            .as_str()
            .ok_or_else(|| wrong_type(key, "string"))
    }

    pub fn get_f64(&self, key: &str) -> Result<f64, MessageError> {
        self.require(key)?
            .as_f64()
            .ok_or_else(|| wrong_type(key, "number"))
    }

    /// Reads a number that must have no fractional part.
    pub fn get_i64(&self, key: &str) -> Result<i64, MessageError> {
        let value = self.require(key)?;

        if let Some(i) = value.as_i64() {
            return Ok(i);
        }

        match value.as_f64() {
            Some(f) if f.trunc() == f && f.is_finite() && f.abs() < i64::MAX as f64 => {
                Ok(f as i64)
            }
            _ => Err(wrong_type(key, "integer")),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, MessageError> {
        self.require(key)?
            .as_bool()
            .ok_or_else(|| wrong_type(key, "bool"))
    }
}

fn wrong_type(key: &str, expected: &'static str) -> MessageError {
    MessageError::WrongType {
        key: key.to_string(),
        expected,
    }
}
