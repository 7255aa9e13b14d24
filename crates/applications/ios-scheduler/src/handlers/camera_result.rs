use super::PipelineContext;
use crate::payloads::{CameraResult, MotionRequest};
use async_trait::async_trait;
use chrono::Utc;
use ios_core::envelope::decode_payload;
use ios_core::{CorrelationKey, IosResult, MessageHandler, MessageType, TopicKey, TopicPattern};
use tracing::{debug, info, warn};

/// Camera inspection finished.
///
/// This is the pipeline's decision point: a valid part is sent on to motion,
/// an invalid one stops here with its error recorded.
pub struct CameraResultHandler {
    ctx: PipelineContext,
}

impl CameraResultHandler {
    /// Catalog name
    pub const NAME: &'static str = "CameraResultHandler";
    /// Topic served when none is configured
    pub const DEFAULT_TOPIC: &'static str = "ios/v1/vision/camera/result";

    /// Create the handler
    #[must_use]
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    async fn request_motion(&self) -> IosResult<()> {
        let request = MotionRequest {
            command: "move_to_position".to_string(),
            pulse: None,
            request_time: Utc::now(),
            source: "camera_detection".to_string(),
        };
        if let Some(target) = self
            .ctx
            .publisher
            .publish(TopicKey::Motion, MessageType::Data, request)
            .await?
        {
            self.ctx.store.set(CorrelationKey::LastMotionRequestTime, Utc::now());
            debug!(topic = %target, "Motion requested");
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for CameraResultHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn supported_topics(&self) -> Vec<TopicPattern> {
        self.ctx.supported_topics("CameraResult", Self::DEFAULT_TOPIC)
    }

    async fn process_message(&self, topic: &str, payload: &str) -> IosResult<()> {
        let result: CameraResult = match decode_payload(payload) {
            Ok(result) => result,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Unreadable camera result, dropping");
                return Ok(());
            }
        };
        info!(topic = %topic, valid = result.is_valid, "Camera result received");

        let now = Utc::now();
        let store = &self.ctx.store;
        store.set(
            CorrelationKey::LastDetectionResult,
            if result.is_valid { "Valid" } else { "Invalid" },
        );
        store.set(CorrelationKey::LastDetectionTime, now);
        store.set(CorrelationKey::LastCameraResult, serde_json::to_value(&result)?);
        self.ctx.record_latency(
            CorrelationKey::LastGratingTriggerTime,
            CorrelationKey::LastProcessingTime,
            now,
            "Detection latency",
        );

        if result.is_valid {
            self.request_motion().await
        } else {
            let reason = result
                .error_message
                .unwrap_or_else(|| "Detection result invalid".to_string());
            warn!(reason = %reason, "Invalid detection, motion skipped");
            store.set(CorrelationKey::LastErrorMessage, reason);
            Ok(())
        }
    }
}
