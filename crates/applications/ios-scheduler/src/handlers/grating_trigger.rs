use super::PipelineContext;
use crate::payloads::DetectionRequest;
use async_trait::async_trait;
use chrono::Utc;
use ios_core::envelope::payload_text;
use ios_core::{CorrelationKey, IosResult, MessageHandler, MessageType, TopicKey, TopicPattern};
use tracing::{debug, info, warn};

/// Grating sensor fired: a part entered the line.
///
/// Starts the pipeline clock and asks the height/vision stage to measure.
pub struct GratingTriggerHandler {
    ctx: PipelineContext,
}

impl GratingTriggerHandler {
    /// Catalog name
    pub const NAME: &'static str = "GratingTriggerHandler";
    /// Topic served when none is configured
    pub const DEFAULT_TOPIC: &'static str = "ios/v1/sensor/grating/trigger";

    /// Create the handler
    #[must_use]
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl MessageHandler for GratingTriggerHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn supported_topics(&self) -> Vec<TopicPattern> {
        self.ctx.supported_topics("GratingTrigger", Self::DEFAULT_TOPIC)
    }

    async fn process_message(&self, topic: &str, payload: &str) -> IosResult<()> {
        let direction = payload_text(payload);
        if direction.is_empty() {
            warn!(topic = %topic, "Empty grating trigger, ignoring");
            return Ok(());
        }
        info!(topic = %topic, direction = %direction, "Grating triggered");

        let now = Utc::now();
        let store = &self.ctx.store;
        store.set(CorrelationKey::LastGratingTriggerTime, now);
        store.set(CorrelationKey::TriggerMessage, direction.as_str());

        let request = DetectionRequest {
            command: "start_detection".to_string(),
            trigger_time: now,
            trigger_source: "grating_sensor".to_string(),
            direction,
        };
        if let Some(target) = self
            .ctx
            .publisher
            .publish(TopicKey::VisionHeight, MessageType::Start, request)
            .await?
        {
            store.set(CorrelationKey::LastVisionRequestTime, Utc::now());
            debug!(topic = %target, "Detection requested");
        }
        Ok(())
    }
}
