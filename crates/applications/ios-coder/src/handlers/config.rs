use super::CoderContext;
use crate::payloads::{ConfigCommand, ConfigResponse};
use async_trait::async_trait;
use chrono::Utc;
use ios_core::envelope::decode_payload;
use ios_core::{CorrelationKey, IosResult, MessageHandler, TopicKey, TopicPattern};
use serde_json::Value;
use tracing::{info, warn};

const CONFIG_RESPONSE: &str = "coder_config_response";

/// Records configuration pushed over the bus and acknowledges it.
///
/// The running listener keeps its startup settings; a new listen address
/// takes effect on the next stage restart.
pub struct CoderConfigHandler {
    ctx: CoderContext,
}

impl CoderConfigHandler {
    /// Catalog name
    pub const NAME: &'static str = "CoderConfigHandler";
    /// Topic served when none is configured
    pub const DEFAULT_TOPIC: &'static str = "ios/v1/coder/config/set";

    /// Create the handler
    #[must_use]
    pub fn new(ctx: CoderContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl MessageHandler for CoderConfigHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn supported_topics(&self) -> Vec<TopicPattern> {
        self.ctx.supported_topics("CoderConfig", Self::DEFAULT_TOPIC)
    }

    async fn process_message(&self, topic: &str, payload: &str) -> IosResult<()> {
        let command: ConfigCommand = match decode_payload(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Invalid coder config command, dropping");
                return Ok(());
            }
        };
        info!(
            command_id = %command.command_id,
            keys = command.configuration.len(),
            "Coder configuration received"
        );

        let store = &self.ctx.store;
        store.set(CorrelationKey::LastCoderConfigUpdateTime, Utc::now());
        store.set(
            CorrelationKey::LastCoderConfig,
            Value::Object(command.configuration.clone()),
        );

        let response = ConfigResponse {
            command_id: command.command_id,
            status: "Success".to_string(),
            message: "Configuration recorded".to_string(),
            applied_config: command.configuration,
            timestamp: Utc::now(),
        };
        self.ctx
            .publisher
            .publish(TopicKey::CoderStatus, CONFIG_RESPONSE, response)
            .await?;
        Ok(())
    }
}
