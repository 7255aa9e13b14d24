//! Payloads exchanged with the other stages.
//!
//! Field names are PascalCase on the wire. Inbound payloads also accept
//! camelCase, since not every publisher agrees on casing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Camera inspection result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CameraResult {
    /// Whether the part passed inspection
    #[serde(alias = "isValid")]
    pub is_valid: bool,
    /// Why it did not
    #[serde(alias = "errorMessage")]
    pub error_message: Option<String>,
    /// Detector-specific details
    #[serde(alias = "detectionResults")]
    pub detection_results: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Coding completion report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CoderResult {
    /// Whether the code was applied
    #[serde(alias = "isSuccess")]
    pub is_success: bool,
    /// Id of the applied code
    #[serde(alias = "codeId")]
    pub code_id: Option<String>,
    /// Failure reason
    #[serde(alias = "errorMessage")]
    pub error_message: Option<String>,
    /// Completion instant reported by the coder
    #[serde(alias = "completedAt")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Request for the height/vision stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DetectionRequest {
    /// Always `start_detection`
    pub command: String,
    /// When the trigger was seen
    pub trigger_time: DateTime<Utc>,
    /// Always `grating_sensor`
    pub trigger_source: String,
    /// Raw trigger message, the travel direction
    pub direction: String,
}

/// Request for the motion stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MotionRequest {
    /// `move_to_position` or `move_to_height`
    pub command: String,
    /// Target pulse count, for height moves
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pulse: Option<String>,
    /// When the request was made
    pub request_time: DateTime<Utc>,
    /// Which result caused it
    pub source: String,
}

/// Request for the coder stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CodingRequest {
    /// Always `start_coding`
    pub command: String,
    /// When the request was made
    pub request_time: DateTime<Utc>,
    /// Always `motion_complete`
    pub source: String,
}

/// Scheduler online/stopped announcement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceStatus {
    /// Service name
    pub service: String,
    /// `online` or `stopped`
    pub status: String,
    /// When the status was produced
    pub timestamp: DateTime<Utc>,
    /// Envelope version in use
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_camera_result_accepts_either_casing() {
        let pascal: CameraResult =
            serde_json::from_value(json!({"IsValid": true, "ErrorMessage": null})).unwrap();
        let camel: CameraResult = serde_json::from_value(json!({"isValid": true})).unwrap();
        assert!(pascal.is_valid);
        assert_eq!(pascal, camel);

        let empty: CameraResult = serde_json::from_value(json!({})).unwrap();
        assert!(!empty.is_valid);
    }

    #[test]
    fn test_coder_result_fields() {
        let result: CoderResult = serde_json::from_value(json!({
            "IsSuccess": true,
            "CodeId": "X",
            "CompletedAt": "2024-05-01T08:00:00Z"
        }))
        .unwrap();
        assert!(result.is_success);
        assert_eq!(result.code_id.as_deref(), Some("X"));
        assert!(result.completed_at.is_some());
    }

    #[test]
    fn test_motion_request_omits_missing_pulse() {
        let request = MotionRequest {
            command: "move_to_position".into(),
            pulse: None,
            request_time: Utc::now(),
            source: "camera_detection".into(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["Command"], "move_to_position");
        assert!(value.get("Pulse").is_none());
    }
}
