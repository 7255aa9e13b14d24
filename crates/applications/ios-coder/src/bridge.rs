//! Forwards gateway notifications onto the bus.

use crate::handlers::CoderContext;
use crate::payloads::{ClientActivity, CoderData, GatewayStatusReport};
use chrono::Utc;
use ios_core::{CorrelationKey, IosResult, TopicKey};
use ios_gateway::{ClientInfo, GatewayEvent};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Message type of frames republished from devices
pub const CODER_DATA: &str = "CoderData";
/// Message type of gateway status reports
pub const CODER_STATUS: &str = "CoderStatus";
/// Message type of connect/disconnect notices
pub const CLIENT_ACTIVITY: &str = "ClientActivity";

/// Pump `events` until `cancel` fires or the gateway goes away.
///
/// Waiters on `stopped` are woken each time a not-running status has been
/// published.
pub async fn run_bridge(
    ctx: CoderContext,
    mut events: broadcast::Receiver<GatewayEvent>,
    cancel: CancellationToken,
    stopped: Arc<Notify>,
) {
    info!("Gateway bridge running");
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(event) => {
                let halted = matches!(&event, GatewayEvent::StatusChanged(status) if !status.is_running);
                if let Err(e) = forward(&ctx, event).await {
                    error!(error = %e, "Failed to forward gateway event");
                }
                if halted {
                    stopped.notify_waiters();
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Gateway bridge lagging, events dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("Gateway bridge stopped");
}

/// Record one gateway event and publish it
pub async fn forward(ctx: &CoderContext, event: GatewayEvent) -> IosResult<()> {
    let store = &ctx.store;
    match event {
        GatewayEvent::DataReceived(frame) => {
            store.set(CorrelationKey::LastCoderData, frame.data.as_str());
            store.set(CorrelationKey::LastCoderDataTime, frame.received_at);
            store.set(CorrelationKey::LastCoderClientId, frame.client_id.to_string());
            store.set(CorrelationKey::LastCoderClientEndpoint, frame.endpoint.as_str());

            let payload = CoderData {
                data: frame.data,
                client_id: frame.client_id,
                client_endpoint: frame.endpoint,
                timestamp: frame.received_at,
                source: "Coder".to_string(),
            };
            ctx.publisher
                .publish(TopicKey::CoderResult, CODER_DATA, payload)
                .await?;
        }
        GatewayEvent::StatusChanged(status) => {
            store.set(CorrelationKey::CoderStatus, status.message.as_str());
            store.set(CorrelationKey::CoderStatusTime, status.at);
            store.set(CorrelationKey::CoderIsRunning, status.is_running);

            let payload = GatewayStatusReport {
                status: status.message,
                is_running: status.is_running,
                timestamp: status.at,
                connected_clients: ctx.gateway.connected_client_count(),
            };
            ctx.publisher
                .publish(TopicKey::CoderStatus, CODER_STATUS, payload)
                .await?;
        }
        GatewayEvent::ClientConnected(client) => activity(ctx, client, "Connected").await?,
        GatewayEvent::ClientDisconnected(client) => activity(ctx, client, "Disconnected").await?,
    }
    Ok(())
}

async fn activity(ctx: &CoderContext, client: ClientInfo, action: &str) -> IosResult<()> {
    let payload = ClientActivity {
        client_id: client.id,
        client_endpoint: client.endpoint,
        action: action.to_string(),
        timestamp: Utc::now(),
        total_clients: ctx.gateway.connected_client_count(),
    };
    ctx.publisher
        .publish(TopicKey::CoderStatus, CLIENT_ACTIVITY, payload)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::Harness;
    use ios_gateway::{DeviceFrame, GatewayStatus};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_frame_is_republished_and_recorded() {
        let mut harness = Harness::new().await;
        let id = Uuid::new_v4();
        let frame = DeviceFrame {
            client_id: id,
            endpoint: "10.0.0.7:5120".into(),
            data: "CODE-42".into(),
            received_at: Utc::now(),
        };

        forward(&harness.ctx, GatewayEvent::DataReceived(frame)).await.unwrap();

        let published = harness.expect("ios/v1/coder/result").await;
        assert_eq!(published["messageType"], CODER_DATA);
        assert_eq!(published["data"]["Data"], "CODE-42");
        assert_eq!(published["data"]["ClientId"], id.to_string());
        assert_eq!(published["data"]["Source"], "Coder");

        let store = &harness.ctx.store;
        assert_eq!(store.text(CorrelationKey::LastCoderData).as_deref(), Some("CODE-42"));
        assert_eq!(
            store.text(CorrelationKey::LastCoderClientEndpoint).as_deref(),
            Some("10.0.0.7:5120")
        );
    }

    #[tokio::test]
    async fn test_status_change_is_reported() {
        let mut harness = Harness::new().await;
        let status = GatewayStatus {
            message: "Server stopped".into(),
            is_running: false,
            at: Utc::now(),
        };

        forward(&harness.ctx, GatewayEvent::StatusChanged(status)).await.unwrap();

        let published = harness.expect("ios/v1/coder/status").await;
        assert_eq!(published["messageType"], CODER_STATUS);
        assert_eq!(published["data"]["Status"], "Server stopped");
        assert_eq!(published["data"]["IsRunning"], false);
        assert_eq!(harness.ctx.store.flag(CorrelationKey::CoderIsRunning), Some(false));
    }

    #[tokio::test]
    async fn test_bridge_exits_on_cancel() {
        let harness = Harness::new().await;
        let cancel = CancellationToken::new();
        let events = harness.ctx.gateway.subscribe();
        let stopped = Arc::new(Notify::new());
        let task = tokio::spawn(run_bridge(harness.ctx.clone(), events, cancel.clone(), stopped));

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_bridge_signals_gateway_stop() {
        let mut harness = Harness::new().await;
        let gateway = harness.ctx.gateway.clone();
        let stopped = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_bridge(
            harness.ctx.clone(),
            gateway.subscribe(),
            cancel.clone(),
            Arc::clone(&stopped),
        ));

        gateway.start().await.unwrap();
        let started = harness.expect("ios/v1/coder/status").await;
        assert_eq!(started["data"]["Status"], "Server started");

        let notified = stopped.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        gateway.stop().await;
        tokio::time::timeout(std::time::Duration::from_secs(2), notified)
            .await
            .unwrap();
        let halted = harness.expect("ios/v1/coder/status").await;
        assert_eq!(halted["data"]["IsRunning"], false);

        cancel.cancel();
        task.await.unwrap();
    }
}
