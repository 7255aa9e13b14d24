//! Pipeline handlers.
//!
//! Each handler serves one inbound topic and follows the same steps: parse
//! the payload, record what arrived in the correlation store, log the latency
//! against an upstream instant when one is known, and publish the next
//! stage's request. A payload that does not parse is logged and dropped.

mod camera_result;
mod coder_complete;
mod grating_trigger;
mod height_result;
mod motion_complete;

pub use camera_result::CameraResultHandler;
pub use coder_complete::CoderCompleteHandler;
pub use grating_trigger::GratingTriggerHandler;
pub use height_result::HeightResultHandler;
pub use motion_complete::MotionCompleteHandler;

use chrono::{DateTime, Utc};
use ios_core::handler::factory;
use ios_core::{CorrelationKey, CorrelationStore, HandlerCatalog, MessageHandler, StagePublisher, TopicPattern};
use std::sync::Arc;
use tracing::info;

/// Collaborators shared by every handler of the stage
#[derive(Debug, Clone)]
pub struct PipelineContext {
    /// Publishes on behalf of the stage
    pub publisher: StagePublisher,
    /// Cross-handler pipeline state
    pub store: CorrelationStore,
}

impl PipelineContext {
    /// Bundle a publisher and a store
    #[must_use]
    pub fn new(publisher: StagePublisher, store: CorrelationStore) -> Self {
        Self { publisher, store }
    }

    /// The configured subscribe pattern for `key`, or `fallback`
    pub(crate) fn supported_topics(&self, key: &str, fallback: &str) -> Vec<TopicPattern> {
        let configured = self
            .publisher
            .topics()
            .subscribe
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map_or(fallback, |(_, topic)| topic.as_str());

        TopicPattern::parse(configured)
            .or_else(|_| TopicPattern::parse(fallback))
            .into_iter()
            .collect()
    }

    /// Record `now - since` under `target` and log it, if `since` is known
    pub(crate) fn record_latency(
        &self,
        since: CorrelationKey,
        target: CorrelationKey,
        now: DateTime<Utc>,
        what: &str,
    ) {
        if let Some(elapsed) = self.store.elapsed_since(since, now) {
            info!(elapsed_ms = elapsed.num_milliseconds(), "{what}");
            self.store.set(target, elapsed);
        }
    }
}

/// Every scheduler handler, named for catalog discovery
#[must_use]
pub fn catalog(ctx: &PipelineContext) -> HandlerCatalog {
    let grating = ctx.clone();
    let camera = ctx.clone();
    let height = ctx.clone();
    let motion = ctx.clone();
    let coder = ctx.clone();

    HandlerCatalog::new()
        .with(
            GratingTriggerHandler::NAME,
            factory(move || Arc::new(GratingTriggerHandler::new(grating.clone())) as Arc<dyn MessageHandler>),
        )
        .with(
            CameraResultHandler::NAME,
            factory(move || Arc::new(CameraResultHandler::new(camera.clone())) as Arc<dyn MessageHandler>),
        )
        .with(
            HeightResultHandler::NAME,
            factory(move || Arc::new(HeightResultHandler::new(height.clone())) as Arc<dyn MessageHandler>),
        )
        .with(
            MotionCompleteHandler::NAME,
            factory(move || Arc::new(MotionCompleteHandler::new(motion.clone())) as Arc<dyn MessageHandler>),
        )
        .with(
            CoderCompleteHandler::NAME,
            factory(move || Arc::new(CoderCompleteHandler::new(coder.clone())) as Arc<dyn MessageHandler>),
        )
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::PipelineContext;
    use crate::settings::SchedulerSettings;
    use ios_core::{BusClient, CorrelationStore, InMemoryBus, MemoryBroker, StagePublisher};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    /// A context over a connected in-memory bus plus a monitor subscribed to
    /// every `ios/` topic
    pub(crate) async fn context() -> (PipelineContext, InMemoryBus, mpsc::UnboundedReceiver<ios_core::BusEvent>) {
        let broker = MemoryBroker::new();
        let bus = Arc::new(InMemoryBus::new(&broker, "scheduler"));
        bus.connect().await.unwrap();

        let monitor = InMemoryBus::new(&broker, "monitor");
        monitor.connect().await.unwrap();
        monitor.subscribe("ios/#").await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        monitor.add_observer(tx);

        let settings = SchedulerSettings::default();
        let publisher = StagePublisher::new(bus, "ios-scheduler", settings.topics, settings.messages);
        (PipelineContext::new(publisher, CorrelationStore::new()), monitor, rx)
    }

    /// Next message seen by the monitor, as (topic, envelope)
    pub(crate) async fn next_message(
        rx: &mut mpsc::UnboundedReceiver<ios_core::BusEvent>,
    ) -> (String, serde_json::Value) {
        loop {
            let event = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for a published message")
                .expect("monitor channel closed");
            if let ios_core::BusEvent::Message { topic, payload } = event {
                return (topic, serde_json::from_str(&payload).unwrap());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SchedulerSettings;

    #[tokio::test]
    async fn test_catalog_covers_default_subscriptions() {
        let (ctx, _monitor, _rx) = test_support::context().await;
        let catalog = catalog(&ctx);
        let subscribe = SchedulerSettings::default().topics.subscribe;

        assert!(catalog.validate(&subscribe).is_ok());
        assert_eq!(
            catalog.lookup("MotionComplete", "ios/v1/motion/control/complete"),
            Some("MotionCompleteHandler")
        );
        // discovered from the topic alone
        assert_eq!(
            catalog.lookup("Unnamed", "ios/v2/coder/complete"),
            Some("CoderCompleteHandler")
        );
    }

    #[tokio::test]
    async fn test_supported_topics_follow_configuration() {
        let (ctx, _monitor, _rx) = test_support::context().await;
        let topics = ctx.supported_topics("cameraresult", "ios/v1/other");
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].as_str(), "ios/v1/vision/camera/result");

        let fallback = ctx.supported_topics("Missing", "ios/v1/other");
        assert_eq!(fallback[0].as_str(), "ios/v1/other");
    }
}
