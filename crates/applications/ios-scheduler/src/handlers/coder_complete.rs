use super::PipelineContext;
use crate::payloads::CoderResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ios_core::envelope::decode_payload;
use ios_core::{CorrelationKey, IosResult, MessageHandler, TopicPattern};
use tracing::{debug, error, info, warn};

/// Coding finished; closes the pipeline and keeps the success/failure tally.
pub struct CoderCompleteHandler {
    ctx: PipelineContext,
}

impl CoderCompleteHandler {
    /// Catalog name
    pub const NAME: &'static str = "CoderCompleteHandler";
    /// Topic served when none is configured
    pub const DEFAULT_TOPIC: &'static str = "ios/v1/coder/service/complete";

    /// Create the handler
    #[must_use]
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    fn record_success(&self, result: &CoderResult, now: DateTime<Utc>) {
        let store = &self.ctx.store;
        let total = store.increment(CorrelationKey::CoderSuccessCount);
        info!(code_id = ?result.code_id, successes = total, "Coding succeeded");

        self.ctx.record_latency(
            CorrelationKey::LastGratingTriggerTime,
            CorrelationKey::LastTotalProcessTime,
            now,
            "Total pipeline time",
        );

        store.set(CorrelationKey::LastOrderUpdateTime, Utc::now());
        if let Some(code_id) = &result.code_id {
            store.set(CorrelationKey::LastOrderId, code_id.as_str());
        }
        debug!(code_id = ?result.code_id, "Order updated");
    }

    fn record_failure(&self, result: &CoderResult) {
        let store = &self.ctx.store;
        let total = store.increment(CorrelationKey::CoderFailureCount);
        let reason = result.error_message.clone().unwrap_or_default();
        error!(reason = %reason, failures = total, "Coding failed");
        store.set(CorrelationKey::LastCoderError, reason);
    }
}

#[async_trait]
impl MessageHandler for CoderCompleteHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn supported_topics(&self) -> Vec<TopicPattern> {
        self.ctx.supported_topics("CoderComplete", Self::DEFAULT_TOPIC)
    }

    async fn process_message(&self, topic: &str, payload: &str) -> IosResult<()> {
        let result: CoderResult = match decode_payload(payload) {
            Ok(result) => result,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Unreadable coder result, dropping");
                return Ok(());
            }
        };

        let now = Utc::now();
        let store = &self.ctx.store;
        store.set(CorrelationKey::LastCoderCompleteTime, now);
        store.set(CorrelationKey::LastCoderResult, serde_json::to_value(&result)?);
        self.ctx.record_latency(
            CorrelationKey::LastCoderRequestTime,
            CorrelationKey::LastCoderExecutionTime,
            now,
            "Coder execution time",
        );

        if result.is_success {
            self.record_success(&result, now);
        } else {
            self.record_failure(&result);
        }
        Ok(())
    }
}
