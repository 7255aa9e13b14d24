//! Notifications raised by the gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registered device connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Connection id
    pub id: Uuid,
    /// Remote `ip:port`
    pub endpoint: String,
    /// When the connection was accepted
    pub connected_at: DateTime<Utc>,
}

/// One decoded frame from a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFrame {
    /// Connection id
    pub client_id: Uuid,
    /// Remote `ip:port`
    pub endpoint: String,
    /// Trimmed frame text
    pub data: String,
    /// When the frame was completed
    pub received_at: DateTime<Utc>,
}

/// Listener state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayStatus {
    /// Human-readable status
    pub message: String,
    /// Whether the listener is accepting connections
    pub is_running: bool,
    /// When the change happened
    pub at: DateTime<Utc>,
}

impl GatewayStatus {
    pub(crate) fn new(message: impl Into<String>, is_running: bool) -> Self {
        Self {
            message: message.into(),
            is_running,
            at: Utc::now(),
        }
    }
}

/// Gateway notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// A device connected
    ClientConnected(ClientInfo),
    /// A device connection closed
    ClientDisconnected(ClientInfo),
    /// A frame arrived
    DataReceived(DeviceFrame),
    /// The listener started or stopped
    StatusChanged(GatewayStatus),
}
