//! The versioned wire envelope around every bus message.
//!
//! ```json
//! { "messageId": "…", "version": "v1", "timestamp": "2024-01-01T00:00:00Z",
//!   "messageType": "Start", "sender": "ios-scheduler",
//!   "data": { … }, "metadata": {} }
//! ```

use crate::{IosError, IosResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Envelope version written when none is configured
pub const DEFAULT_VERSION: &str = "v1";

/// Kind of message carried by an [`Envelope`].
///
/// Stages also use free-form names (`"motion_control"`, `"CoderData"`), which
/// round-trip through [`MessageType::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Starts an operation in the receiving stage
    Start,
    /// Carries data or a command
    Data,
    /// Status report
    Status,
    /// Completion of an operation
    Complete,
    /// Failure report
    Error,
    /// Stage-specific message type
    Custom(String),
}

impl MessageType {
    /// Wire name of this message type
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Start => "Start",
            Self::Data => "Data",
            Self::Status => "Status",
            Self::Complete => "Complete",
            Self::Error => "Error",
            Self::Custom(name) => name,
        }
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Start" => Self::Start,
            "Data" => Self::Data,
            "Status" => Self::Status,
            "Complete" => Self::Complete,
            "Error" => Self::Error,
            _ => Self::Custom(value),
        }
    }
}

impl From<&str> for MessageType {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Versioned, typed payload wrapper. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T = serde_json::Value> {
    message_id: Uuid,
    version: String,
    timestamp: DateTime<Utc>,
    message_type: MessageType,
    #[serde(default)]
    sender: String,
    data: Option<T>,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

impl<T> Envelope<T> {
    /// Create a new envelope stamped with a fresh id and the current time
    pub fn new(message_type: impl Into<MessageType>, sender: impl Into<String>, data: T) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            version: DEFAULT_VERSION.to_string(),
            timestamp: Utc::now(),
            message_type: message_type.into(),
            sender: sender.into(),
            data: Some(data),
            metadata: HashMap::new(),
        }
    }

    /// Replace the version stamp
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Add a metadata entry
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Unique message id
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// Envelope version
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Creation time
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Message type
    pub fn message_type(&self) -> &MessageType {
        &self.message_type
    }

    /// Publishing stage
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Payload, if any
    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    /// Consume the envelope and return its payload
    pub fn into_data(self) -> Option<T> {
        self.data
    }

    /// Metadata map
    pub fn metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.metadata
    }

    /// Check the fields a receiver relies on
    pub fn validate(&self) -> IosResult<()> {
        if self.version.trim().is_empty() {
            return Err(IosError::invalid_input("Envelope version is empty"));
        }
        if self.sender.trim().is_empty() {
            return Err(IosError::invalid_input("Envelope sender is empty"));
        }
        if self.data.is_none() {
            return Err(IosError::invalid_input("Envelope carries no data"));
        }
        Ok(())
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serialize to the JSON wire form
    pub fn to_json(&self) -> IosResult<String> {
        serde_json::to_string(self).map_err(IosError::from)
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Parse the JSON wire form
    pub fn from_json(raw: &str) -> IosResult<Self> {
        serde_json::from_str(raw).map_err(IosError::from)
    }
}

/// Extract the payload from a raw bus message.
///
/// Publishers are not uniform: some send a full envelope, some send the bare
/// payload. An object carrying both `messageType` and `data` keys is treated
/// as an envelope and its `data` returned; anything else is the payload
/// itself. Non-JSON text comes back as a JSON string.
#[must_use]
pub fn unwrap_payload(raw: &str) -> serde_json::Value {
    let trimmed = raw.trim();
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Object(mut map))
            if map.contains_key("messageType") && map.contains_key("data") =>
        {
            map.remove("data").unwrap_or(serde_json::Value::Null)
        }
        Ok(value) => value,
        Err(_) => serde_json::Value::String(trimmed.to_string()),
    }
}

/// [`unwrap_payload`] followed by a typed decode
pub fn decode_payload<P: DeserializeOwned>(raw: &str) -> IosResult<P> {
    if raw.trim().is_empty() {
        return Err(IosError::serialization("Message payload is empty"));
    }
    serde_json::from_value(unwrap_payload(raw)).map_err(IosError::from)
}

/// The payload as display text: strings unquoted, other JSON compact
#[must_use]
pub fn payload_text(raw: &str) -> String {
    match unwrap_payload(raw) {
        serde_json::Value::String(text) => text,
        other => other.to_string(),
    }
}
