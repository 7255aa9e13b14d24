//! Coder stage settings.

use ios_core::logging::LogSettings;
use ios_core::{BusSettings, IosResult, MessageSettings, TopicSettings, Validatable};
use ios_gateway::GatewayConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything the coder stage reads from configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoderSettings {
    /// Broker connection
    pub bus: BusSettings,
    /// Subscribe and publish topic maps
    pub topics: TopicSettings,
    /// Envelope settings
    pub messages: MessageSettings,
    /// Log output
    pub logging: LogSettings,
    /// Device listener
    pub gateway: GatewayConfig,
}

impl Default for CoderSettings {
    fn default() -> Self {
        let map = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
            pairs
                .iter()
                .map(|(key, topic)| ((*key).to_string(), (*topic).to_string()))
                .collect()
        };

        Self {
            bus: BusSettings::default(),
            topics: TopicSettings {
                subscribe: map(&[
                    ("CoderService", "ios/v1/coder/service/start"),
                    ("CoderConfig", "ios/v1/coder/config/set"),
                ]),
                publish: map(&[
                    ("Coder", "ios/v1/coder/service/complete"),
                    ("CoderResult", "ios/v1/coder/result"),
                    ("CoderStatus", "ios/v1/coder/status"),
                ]),
            },
            messages: MessageSettings::default(),
            logging: LogSettings::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl Validatable for CoderSettings {
    fn validate(&self) -> IosResult<()> {
        self.bus.validate()?;
        self.topics.validate()?;
        self.messages.validate()?;
        self.gateway.validate()
    }
}
