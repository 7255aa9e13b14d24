//! Coder stage payloads. PascalCase on the wire; inbound also takes camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Frame read from a device, republished on the result topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CoderData {
    /// Frame text
    pub data: String,
    /// Connection id
    pub client_id: Uuid,
    /// Remote endpoint
    pub client_endpoint: String,
    /// When the frame arrived
    pub timestamp: DateTime<Utc>,
    /// Always `Coder`
    pub source: String,
}

/// Listener state report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GatewayStatusReport {
    /// Status text
    pub status: String,
    /// Whether the listener is accepting
    pub is_running: bool,
    /// When the state changed
    pub timestamp: DateTime<Utc>,
    /// Connections at that moment
    pub connected_clients: usize,
}

/// Device connected or disconnected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientActivity {
    /// Connection id
    pub client_id: Uuid,
    /// Remote endpoint
    pub client_endpoint: String,
    /// `Connected` or `Disconnected`
    pub action: String,
    /// When it happened
    pub timestamp: DateTime<Utc>,
    /// Connections after the change
    pub total_clients: usize,
}

/// Inbound service command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServiceCommand {
    /// Caller-chosen id echoed in the reply
    #[serde(alias = "commandId")]
    pub command_id: String,
    /// `start`, `stop`, `connect`, `disconnect` or `send`
    #[serde(alias = "action")]
    pub action: String,
    /// Action parameters
    #[serde(alias = "parameters")]
    pub parameters: Option<Map<String, Value>>,
}

impl Default for ServiceCommand {
    fn default() -> Self {
        Self {
            command_id: Uuid::new_v4().to_string(),
            action: "start".to_string(),
            parameters: None,
        }
    }
}

/// Parameters of a `send` command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SendParameters {
    /// Target connection; every connection when absent
    #[serde(alias = "clientId", default)]
    pub client_id: Option<String>,
    /// Text to write
    #[serde(alias = "data")]
    pub data: String,
}

/// Reply to a [`ServiceCommand`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceOutcome {
    /// Echoed command id
    pub command_id: String,
    /// Echoed action
    pub action: String,
    /// `Success` or `Failed`
    pub status: String,
    /// Whether the action succeeded
    pub is_success: bool,
    /// Human-readable result
    pub message: String,
    /// Action duration in milliseconds
    pub execution_time: f64,
    /// When the reply was produced
    pub timestamp: DateTime<Utc>,
}

/// Inbound configuration command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConfigCommand {
    /// Caller-chosen id echoed in the reply
    #[serde(alias = "commandId")]
    pub command_id: String,
    /// Settings to apply
    #[serde(alias = "configuration")]
    pub configuration: Map<String, Value>,
}

impl Default for ConfigCommand {
    fn default() -> Self {
        Self {
            command_id: Uuid::new_v4().to_string(),
            configuration: Map::new(),
        }
    }
}

/// Reply to a [`ConfigCommand`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigResponse {
    /// Echoed command id
    pub command_id: String,
    /// `Success` or `Failed`
    pub status: String,
    /// Human-readable result
    pub message: String,
    /// The configuration as received
    pub applied_config: Map<String, Value>,
    /// When the reply was produced
    pub timestamp: DateTime<Utc>,
}
