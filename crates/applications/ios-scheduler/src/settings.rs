//! Scheduler settings.

use ios_core::logging::LogSettings;
use ios_core::{BusSettings, IosError, IosResult, MessageSettings, TopicSettings, Validatable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Everything the scheduler stage reads from configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Broker connection
    pub bus: BusSettings,
    /// Subscribe map (handler key to pattern) and publish map (topic key to topic)
    pub topics: TopicSettings,
    /// Envelope settings
    pub messages: MessageSettings,
    /// Log output
    pub logging: LogSettings,
    /// Period of the counter heartbeat log; 0 disables it
    pub heartbeat_interval_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            bus: BusSettings::default(),
            topics: default_topics(),
            messages: MessageSettings::default(),
            logging: LogSettings::default(),
            heartbeat_interval_secs: 60,
        }
    }
}

impl SchedulerSettings {
    /// Heartbeat period, if enabled
    #[must_use]
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }
}

impl Validatable for SchedulerSettings {
    fn validate(&self) -> IosResult<()> {
        self.bus.validate()?;
        self.topics.validate()?;
        self.messages.validate()?;
        if self.topics.subscribe.is_empty() {
            return Err(IosError::config("Scheduler has no subscribe topics configured"));
        }
        Ok(())
    }
}

fn default_topics() -> TopicSettings {
    let map = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(key, topic)| ((*key).to_string(), (*topic).to_string()))
            .collect()
    };

    TopicSettings {
        subscribe: map(&[
            ("GratingTrigger", "ios/v1/sensor/grating/trigger"),
            ("CameraResult", "ios/v1/vision/camera/result"),
            ("HeightResult", "ios/v1/vision/height/result"),
            ("MotionComplete", "ios/v1/motion/control/complete"),
            ("CoderComplete", "ios/v1/coder/service/complete"),
        ]),
        publish: map(&[
            ("Sensor", "ios/v1/sensor/status"),
            ("VisionHeight", "ios/v1/vision/height/start"),
            ("Vision", "ios/v1/vision/camera/start"),
            ("Motion", "ios/v1/motion/control/move"),
            ("Coder", "ios/v1/coder/service/start"),
        ]),
    }
}
