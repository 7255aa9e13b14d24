//! Configuration management for the pipeline stages.
//!
//! Settings are plain serde structs with `Default` impls. [`load_settings`]
//! layers, in increasing precedence: the defaults, an optional TOML file, and
//! environment variables of the form `<PREFIX>__SECTION__FIELD`.

use crate::topic::validate_pattern;
use crate::traits::Validatable;
use crate::{IosError, IosResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Semantic names under which publish topics are configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopicKey {
    /// Sensor and service status
    Sensor,
    /// Camera inspection
    Vision,
    /// Motion positioning
    Motion,
    /// Marking/coding service
    Coder,
    /// Raw data read by coder devices
    CoderResult,
    /// Coder gateway status
    CoderStatus,
    /// Scheduler stage
    Scheduler,
    /// Height measurement
    VisionHeight,
}

impl TopicKey {
    /// All keys, in declaration order
    pub const ALL: [TopicKey; 8] = [
        TopicKey::Sensor,
        TopicKey::Vision,
        TopicKey::Motion,
        TopicKey::Coder,
        TopicKey::CoderResult,
        TopicKey::CoderStatus,
        TopicKey::Scheduler,
        TopicKey::VisionHeight,
    ];

    /// Configuration key text
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sensor => "Sensor",
            Self::Vision => "Vision",
            Self::Motion => "Motion",
            Self::Coder => "Coder",
            Self::CoderResult => "CoderResult",
            Self::CoderStatus => "CoderStatus",
            Self::Scheduler => "Scheduler",
            Self::VisionHeight => "VisionHeight",
        }
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publish and subscribe topic maps keyed by semantic name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicSettings {
    /// Subscribe patterns, keyed by handler name
    pub subscribe: BTreeMap<String, String>,
    /// Publish topics, keyed by [`TopicKey`] name
    pub publish: BTreeMap<String, String>,
}

impl TopicSettings {
    /// Resolve the publish topic for `key`.
    ///
    /// Key comparison ignores ASCII case because configuration sources do not
    /// preserve it. When no key matches, the first configured topic whose text
    /// contains the key name is used.
    #[must_use]
    pub fn publish_topic(&self, key: TopicKey) -> Option<&str> {
        let name = key.as_str();
        self.publish
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .or_else(|| self.publish.iter().find(|(_, topic)| topic.contains(name)))
            .map(|(_, topic)| topic.as_str())
    }

    /// Every configured subscribe pattern
    #[must_use]
    pub fn subscribe_topics(&self) -> Vec<String> {
        self.subscribe.values().cloned().collect()
    }
}

impl Validatable for TopicSettings {
    fn validate(&self) -> IosResult<()> {
        for (key, pattern) in &self.subscribe {
            validate_pattern(pattern)
                .map_err(|e| IosError::config(format!("Subscribe topic '{key}': {e}")))?;
        }
        for (key, topic) in &self.publish {
            crate::topic::validate_topic(topic)
                .map_err(|e| IosError::config(format!("Publish topic '{key}': {e}")))?;
        }
        Ok(())
    }
}

/// Broker connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Broker host
    pub broker: String,
    /// Broker port
    pub port: u16,
    /// Client id; generated from the stage name when unset
    pub client_id: Option<String>,
    /// Optional username
    pub username: Option<String>,
    /// Optional password
    pub password: Option<String>,
    /// MQTT keep-alive period
    pub keep_alive_secs: u64,
    /// Delay before the first reconnect attempt after a drop
    pub reconnect_delay_ms: u64,
    /// Upper bound on the initial connect
    pub connection_timeout_secs: u64,
    /// Request a clean session
    pub clean_session: bool,
    /// Interval between reconnect attempts
    pub reconnect_interval_secs: u64,
    /// Request channel capacity of the client
    pub channel_capacity: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: 30,
            reconnect_delay_ms: 2000,
            connection_timeout_secs: 30,
            clean_session: true,
            reconnect_interval_secs: 5,
            channel_capacity: 64,
        }
    }
}

impl BusSettings {
    /// Keep-alive as a `Duration`
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// Initial connect bound as a `Duration`
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Reconnect interval as a `Duration`
    #[must_use]
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    /// First reconnect delay as a `Duration`
    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Validatable for BusSettings {
    fn validate(&self) -> IosResult<()> {
        if self.broker.trim().is_empty() {
            return Err(IosError::config("Broker address is empty"));
        }
        if self.port == 0 {
            return Err(IosError::config("Broker port must not be 0"));
        }
        if self.keep_alive_secs == 0 {
            return Err(IosError::config("Keep-alive must be positive"));
        }
        if self.channel_capacity == 0 {
            return Err(IosError::config("Channel capacity must be positive"));
        }
        Ok(())
    }
}

/// Envelope settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageSettings {
    /// Version stamped on outgoing envelopes
    pub version: String,
    /// Validate envelopes before publishing
    pub enable_validation: bool,
    /// Publish attempts for transient bus errors
    pub max_retries: u32,
    /// Per-publish timeout
    pub timeout_seconds: u64,
}

impl Default for MessageSettings {
    fn default() -> Self {
        Self {
            version: crate::envelope::DEFAULT_VERSION.to_string(),
            enable_validation: true,
            max_retries: 3,
            timeout_seconds: 30,
        }
    }
}

impl MessageSettings {
    /// Per-publish timeout as a `Duration`
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl Validatable for MessageSettings {
    fn validate(&self) -> IosResult<()> {
        if self.version.trim().is_empty() {
            return Err(IosError::config("Message version is empty"));
        }
        if self.timeout_seconds == 0 {
            return Err(IosError::config("Message timeout must be positive"));
        }
        Ok(())
    }
}

/// Load settings from defaults, an optional TOML file, and the environment.
///
/// Environment variables use `__` between the prefix and each nesting level:
/// `IOS_SCHEDULER__BUS__BROKER=10.0.0.5`.
pub fn load_settings<T>(path: Option<&Path>, env_prefix: &str) -> IosResult<T>
where
    T: DeserializeOwned + Validatable,
{
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        if !path.exists() {
            return Err(IosError::config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix(env_prefix)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let settings: T = builder.build()?.try_deserialize()?;
    settings.validate()?;
    Ok(settings)
}
