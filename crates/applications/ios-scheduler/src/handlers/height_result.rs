use super::PipelineContext;
use crate::payloads::MotionRequest;
use async_trait::async_trait;
use chrono::Utc;
use ios_core::envelope::payload_text;
use ios_core::{CorrelationKey, IosResult, MessageHandler, TopicKey, TopicPattern};
use tracing::{debug, info, warn};

/// Message type the motion stage expects for height moves
const MOTION_CONTROL: &str = "motion_control";

/// Height measurement finished; the payload is the target pulse count.
pub struct HeightResultHandler {
    ctx: PipelineContext,
}

impl HeightResultHandler {
    /// Catalog name
    pub const NAME: &'static str = "HeightResultHandler";
    /// Topic served when none is configured
    pub const DEFAULT_TOPIC: &'static str = "ios/v1/vision/height/result";

    /// Create the handler
    #[must_use]
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl MessageHandler for HeightResultHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn supported_topics(&self) -> Vec<TopicPattern> {
        self.ctx.supported_topics("HeightResult", Self::DEFAULT_TOPIC)
    }

    async fn process_message(&self, topic: &str, payload: &str) -> IosResult<()> {
        let pulse = payload_text(payload);
        if pulse.is_empty() {
            warn!(topic = %topic, "Empty height result, ignoring");
            return Ok(());
        }
        info!(topic = %topic, pulse = %pulse, "Height result received");

        let now = Utc::now();
        let store = &self.ctx.store;
        store.set(CorrelationKey::LastHeightResult, pulse.as_str());
        store.set(CorrelationKey::LastHeightDetectionTime, now);
        self.ctx.record_latency(
            CorrelationKey::LastGratingTriggerTime,
            CorrelationKey::LastHeightProcessingTime,
            now,
            "Height detection latency",
        );

        let request = MotionRequest {
            command: "move_to_height".to_string(),
            pulse: Some(pulse),
            request_time: Utc::now(),
            source: "height_detection".to_string(),
        };
        if let Some(target) = self
            .ctx
            .publisher
            .publish(TopicKey::Motion, MOTION_CONTROL, request)
            .await?
        {
            store.set(CorrelationKey::LastMotionRequestTime, Utc::now());
            debug!(topic = %target, "Height move requested");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::{context, next_message};

    #[tokio::test]
    async fn test_height_result_requests_move() {
        let (ctx, _monitor, mut rx) = context().await;
        ctx.store.set(CorrelationKey::LastGratingTriggerTime, Utc::now());
        let handler = HeightResultHandler::new(ctx.clone());

        handler.process_message(HeightResultHandler::DEFAULT_TOPIC, "12800").await.unwrap();

        let (topic, envelope) = next_message(&mut rx).await;
        assert_eq!(topic, "ios/v1/motion/control/move");
        assert_eq!(envelope["messageType"], "motion_control");
        assert_eq!(envelope["data"]["Command"], "move_to_height");
        assert_eq!(envelope["data"]["Pulse"], "12800");

        assert_eq!(ctx.store.text(CorrelationKey::LastHeightResult).as_deref(), Some("12800"));
        assert!(ctx.store.elapsed(CorrelationKey::LastHeightProcessingTime).is_some());
        assert!(ctx.store.contains(CorrelationKey::LastMotionRequestTime));
    }
}
