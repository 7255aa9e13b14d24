//! The scheduler stage and its assembly.

use crate::handlers::{catalog, PipelineContext};
use crate::payloads::ServiceStatus;
use crate::settings::SchedulerSettings;
use crate::SERVICE_NAME;
use async_trait::async_trait;
use chrono::Utc;
use ios_core::handler::{factory, DefaultHandler};
use ios_core::{
    BusClient, CorrelationKey, CorrelationStore, Dispatcher, IosResult, LifecycleSupervisor, MessageHandler,
    MessageType, Stage, StagePublisher, TopicKey, Validatable,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Scheduler business logic around the shared lifecycle
pub struct SchedulerStage {
    ctx: PipelineContext,
    dispatcher: Arc<Dispatcher>,
    subscriptions: Vec<String>,
    version: String,
    heartbeat: Option<Duration>,
}

impl SchedulerStage {
    /// Announce the service status on the sensor status topic
    async fn publish_status(&self, status: &str) -> IosResult<()> {
        let payload = ServiceStatus {
            service: SERVICE_NAME.to_string(),
            status: status.to_string(),
            timestamp: Utc::now(),
            version: self.version.clone(),
        };
        self.ctx
            .publisher
            .publish(TopicKey::Sensor, MessageType::Data, payload)
            .await?;
        Ok(())
    }

    fn log_heartbeat(&self) {
        let store = &self.ctx.store;
        let dispatch = self.dispatcher.stats();
        info!(
            dispatched = dispatch.dispatched,
            failed = dispatch.failed,
            unmatched = dispatch.unmatched,
            coded = store.count(CorrelationKey::CoderSuccessCount),
            coding_failures = store.count(CorrelationKey::CoderFailureCount),
            last_total_ms = store
                .elapsed(CorrelationKey::LastTotalProcessTime)
                .map(|d| d.num_milliseconds()),
            "Scheduler heartbeat"
        );
    }
}

#[async_trait]
impl Stage for SchedulerStage {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.clone()
    }

    async fn on_starting(&self) -> IosResult<()> {
        info!(topics = self.subscriptions.len(), "Scheduler initialising");
        Ok(())
    }

    async fn on_stopping(&self) -> IosResult<()> {
        info!("Scheduler releasing resources");
        if let Err(e) = self.publish_status("stopped").await {
            error!(error = %e, "Failed to publish stopped status");
        }
        Ok(())
    }

    async fn on_connection_changed(&self, connected: bool) {
        if connected {
            info!("Bus connected, announcing scheduler online");
            if let Err(e) = self.publish_status("online").await {
                error!(error = %e, "Failed to publish online status");
            }
        } else {
            warn!("Bus connection lost");
        }
    }

    async fn run(&self, cancel: CancellationToken) -> IosResult<()> {
        let Some(period) = self.heartbeat else {
            cancel.cancelled().await;
            return Ok(());
        };

        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => self.log_heartbeat(),
            }
        }
    }
}

/// Build the scheduler: validate settings, check that every subscribe entry
/// has a handler, and wire the stage to `bus`.
///
/// The handler registry itself is built on the first dispatch. `store` is
/// shared with the handlers, so callers can keep a clone to inspect it.
pub fn assemble(
    settings: SchedulerSettings,
    bus: Arc<dyn BusClient>,
    store: CorrelationStore,
) -> IosResult<LifecycleSupervisor> {
    settings.validate()?;

    let publisher = StagePublisher::new(
        Arc::clone(&bus),
        SERVICE_NAME,
        settings.topics.clone(),
        settings.messages.clone(),
    );
    let ctx = PipelineContext::new(publisher, store);

    let handlers = catalog(&ctx);
    handlers.validate(&settings.topics.subscribe)?;

    let subscribe = settings.topics.subscribe.clone();
    let dispatcher = Arc::new(Dispatcher::lazy(move || {
        handlers.bind(
            &subscribe,
            factory(|| Arc::new(DefaultHandler) as Arc<dyn MessageHandler>),
        )
    }));

    let stage = SchedulerStage {
        ctx,
        dispatcher: Arc::clone(&dispatcher),
        subscriptions: settings.topics.subscribe_topics(),
        version: settings.messages.version.clone(),
        heartbeat: settings.heartbeat_interval(),
    };

    Ok(LifecycleSupervisor::new(bus, dispatcher, Arc::new(stage)))
}
