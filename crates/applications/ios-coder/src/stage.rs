//! The coder stage and its assembly.

use crate::bridge::{run_bridge, CODER_STATUS};
use crate::handlers::{catalog, CoderContext};
use crate::payloads::GatewayStatusReport;
use crate::settings::CoderSettings;
use crate::SERVICE_NAME;
use async_trait::async_trait;
use chrono::Utc;
use ios_core::handler::{factory, DefaultHandler};
use ios_core::{
    BusClient, CorrelationStore, Dispatcher, IosError, IosResult, LifecycleSupervisor, MessageHandler, Stage,
    StagePublisher, TopicKey, Validatable,
};
use ios_gateway::{DeviceGateway, GatewayEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long stop waits for the final gateway status to reach the bus
const STOP_REPORT_TIMEOUT: Duration = Duration::from_secs(2);

/// Device gateway plus its bus bridge, run under the shared lifecycle
pub struct CoderStage {
    ctx: CoderContext,
    subscriptions: Vec<String>,
    events: Mutex<Option<broadcast::Receiver<GatewayEvent>>>,
    stopped: Arc<Notify>,
}

impl CoderStage {
    async fn publish_status(&self) -> IosResult<()> {
        let gateway = &self.ctx.gateway;
        let running = gateway.is_running();
        let payload = GatewayStatusReport {
            status: if running { "Server running" } else { "Server stopped" }.to_string(),
            is_running: running,
            timestamp: Utc::now(),
            connected_clients: gateway.connected_client_count(),
        };
        self.ctx
            .publisher
            .publish(TopicKey::CoderStatus, CODER_STATUS, payload)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Stage for CoderStage {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.clone()
    }

    async fn on_starting(&self) -> IosResult<()> {
        {
            let mut slot = self.events.lock().await;
            if slot.is_none() {
                *slot = Some(self.ctx.gateway.subscribe());
            }
        }

        let addr = self.ctx.gateway.start().await.map_err(IosError::from)?;
        info!(address = %addr, "Coder gateway listening");
        Ok(())
    }

    async fn on_stopping(&self) -> IosResult<()> {
        let reported = self.stopped.notified();
        tokio::pin!(reported);
        reported.as_mut().enable();

        if !self.ctx.gateway.stop().await {
            return Ok(());
        }
        if tokio::time::timeout(STOP_REPORT_TIMEOUT, reported)
            .await
            .is_err()
        {
            warn!("Gateway stop was not reported before shutdown");
        }
        Ok(())
    }

    async fn on_connection_changed(&self, connected: bool) {
        if connected {
            info!("Bus connected, reporting gateway status");
            if let Err(e) = self.publish_status().await {
                error!(error = %e, "Failed to publish gateway status");
            }
        } else {
            warn!("Bus connection lost; device frames are dropped until it returns");
        }
    }

    async fn run(&self, cancel: CancellationToken) -> IosResult<()> {
        let events = match self.events.lock().await.take() {
            Some(events) => events,
            None => self.ctx.gateway.subscribe(),
        };
        run_bridge(self.ctx.clone(), events, cancel, Arc::clone(&self.stopped)).await;
        Ok(())
    }
}

/// Build the coder stage: validate settings, check every subscribe entry
/// has a handler, and create the device gateway.
///
/// The gateway is returned alongside the supervisor; it only listens while
/// the supervisor is running.
pub fn assemble(
    settings: CoderSettings,
    bus: Arc<dyn BusClient>,
    store: CorrelationStore,
) -> IosResult<(LifecycleSupervisor, DeviceGateway)> {
    settings.validate()?;

    let publisher = StagePublisher::new(
        Arc::clone(&bus),
        SERVICE_NAME,
        settings.topics.clone(),
        settings.messages.clone(),
    );
    let gateway = DeviceGateway::new(settings.gateway.clone());
    let ctx = CoderContext::new(publisher, store, gateway.clone());

    let handlers = catalog(&ctx);
    handlers.validate(&settings.topics.subscribe)?;

    let subscribe = settings.topics.subscribe.clone();
    let dispatcher = Arc::new(Dispatcher::lazy(move || {
        handlers.bind(
            &subscribe,
            factory(|| Arc::new(DefaultHandler) as Arc<dyn MessageHandler>),
        )
    }));

    let stage = CoderStage {
        ctx,
        subscriptions: settings.topics.subscribe_topics(),
        events: Mutex::new(None),
        stopped: Arc::new(Notify::new()),
    };

    Ok((LifecycleSupervisor::new(bus, dispatcher, Arc::new(stage)), gateway))
}
