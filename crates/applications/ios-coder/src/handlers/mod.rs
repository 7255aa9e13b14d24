//! Bus command handlers of the coder stage.

mod config;
mod service;

pub use config::CoderConfigHandler;
pub use service::CoderServiceHandler;

use ios_core::handler::factory;
use ios_core::{CorrelationStore, HandlerCatalog, MessageHandler, StagePublisher, TopicPattern};
use ios_gateway::DeviceGateway;
use std::sync::Arc;

/// Collaborators shared by the coder handlers and the gateway bridge
#[derive(Debug, Clone)]
pub struct CoderContext {
    /// Publishes on behalf of the stage
    pub publisher: StagePublisher,
    /// Stage correlation state
    pub store: CorrelationStore,
    /// The device listener
    pub gateway: DeviceGateway,
}

impl CoderContext {
    /// Bundle the collaborators
    #[must_use]
    pub fn new(publisher: StagePublisher, store: CorrelationStore, gateway: DeviceGateway) -> Self {
        Self {
            publisher,
            store,
            gateway,
        }
    }

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
}

/// Every coder handler, named for catalog discovery
#[must_use]
pub fn catalog(ctx: &CoderContext) -> HandlerCatalog {
    let service = ctx.clone();
    let config = ctx.clone();

    HandlerCatalog::new()
        .with(
            CoderServiceHandler::NAME,
            factory(move || Arc::new(CoderServiceHandler::new(service.clone())) as Arc<dyn MessageHandler>),
        )
        .with(
            CoderConfigHandler::NAME,
            factory(move || Arc::new(CoderConfigHandler::new(config.clone())) as Arc<dyn MessageHandler>),
        )
}
