use super::PipelineContext;
use crate::payloads::CodingRequest;
use async_trait::async_trait;
use chrono::Utc;
use ios_core::envelope::payload_text;
use ios_core::{CorrelationKey, IosResult, MessageHandler, MessageType, TopicKey, TopicPattern};
use tracing::{debug, info};

/// Motion reached its position; the part is ready to be coded.
pub struct MotionCompleteHandler {
    ctx: PipelineContext,
}

impl MotionCompleteHandler {
    /// Catalog name
    pub const NAME: &'static str = "MotionCompleteHandler";
    /// Topic served when none is configured
    pub const DEFAULT_TOPIC: &'static str = "ios/v1/motion/control/complete";

    /// Create the handler
    #[must_use]
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl MessageHandler for MotionCompleteHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn supported_topics(&self) -> Vec<TopicPattern> {
        self.ctx.supported_topics("MotionComplete", Self::DEFAULT_TOPIC)
    }

    async fn process_message(&self, topic: &str, payload: &str) -> IosResult<()> {
        info!(topic = %topic, "Motion complete");

        let now = Utc::now();
        let store = &self.ctx.store;
        store.set(CorrelationKey::LastMotionCompleteTime, now);
        store.set(CorrelationKey::LastMotionCompleteMessage, payload_text(payload));
        self.ctx.record_latency(
            CorrelationKey::LastMotionRequestTime,
            CorrelationKey::LastMotionExecutionTime,
            now,
            "Motion execution time",
        );

        let request = CodingRequest {
            command: "start_coding".to_string(),
            request_time: Utc::now(),
            source: "motion_complete".to_string(),
        };
        if let Some(target) = self
            .ctx
            .publisher
            .publish(TopicKey::Coder, MessageType::Start, request)
            .await?
        {
            store.set(CorrelationKey::LastCoderRequestTime, Utc::now());
            debug!(topic = %target, "Coding requested");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::{context, next_message};

    #[tokio::test]
    async fn test_motion_complete_requests_coding() {
        let (ctx, _monitor, mut rx) = context().await;
        ctx.store.set(CorrelationKey::LastMotionRequestTime, Utc::now());
        let handler = MotionCompleteHandler::new(ctx.clone());

        handler.process_message(MotionCompleteHandler::DEFAULT_TOPIC, "{}").await.unwrap();

        let (topic, envelope) = next_message(&mut rx).await;
        assert_eq!(topic, "ios/v1/coder/service/start");
        assert_eq!(envelope["messageType"], "Start");
        assert_eq!(envelope["data"]["Command"], "start_coding");
        assert_eq!(envelope["data"]["Source"], "motion_complete");

        assert_eq!(ctx.store.text(CorrelationKey::LastMotionCompleteMessage).as_deref(), Some("{}"));
        assert!(ctx.store.elapsed(CorrelationKey::LastMotionExecutionTime).is_some());
        assert!(ctx.store.contains(CorrelationKey::LastCoderRequestTime));
    }
}
