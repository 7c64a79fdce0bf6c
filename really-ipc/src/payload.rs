//! Payload abstraction: a serializable unit of work with a typed result

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::IpcError;

/// A unit of work dispatched to a worker process.
///
/// The pool serializes the payload into the request frame, the worker
/// deserializes it and hands it to its handler exactly once. The handler's
/// return value travels back as `Output`.
pub trait Payload: Serialize + DeserializeOwned + Send + 'static {
    /// Value produced by the worker's handler
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Serialize into a request frame body
    fn encode(&self) -> Result<Vec<u8>, IpcError> {
        serde_json::to_vec(self).map_err(|e| IpcError::SerializationError(e.to_string()))
    }

    /// Deserialize from a request frame body
    fn decode(bytes: &[u8]) -> Result<Self, IpcError> {
        serde_json::from_slice(bytes).map_err(|e| IpcError::DeserializationError(e.to_string()))
    }
}

/// Schemaless payload carrying a JSON object; the handler answers with any JSON value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenericPayload {
    pub data: Map<String, JsonValue>,
}

impl GenericPayload {
    /// Create a payload from an object map
    pub fn new(data: Map<String, JsonValue>) -> Self {
        Self { data }
    }

    /// Create a payload from a JSON value; anything but an object is rejected
    pub fn create(value: JsonValue) -> Result<Self, IpcError> {
        match value {
            JsonValue::Object(data) => Ok(Self { data }),
            other => Err(IpcError::InvalidMessage(format!(
                "generic payload must be a JSON object, got {}",
                other
            ))),
        }
    }

    /// Add a field, builder style
    pub fn with(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(JsonValue::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.data.get(key).and_then(JsonValue::as_u64)
    }
}

impl Payload for GenericPayload {
    type Output = JsonValue;
}
