use super::CoderContext;
use crate::payloads::{SendParameters, ServiceCommand, ServiceOutcome};
use async_trait::async_trait;
use chrono::Utc;
use ios_core::envelope::decode_payload;
use ios_core::{CorrelationKey, IosResult, MessageHandler, TopicKey, TopicPattern};
use ios_gateway::GatewayError;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Message type of service replies
const SERVICE_COMPLETE: &str = "coder_service_complete";

/// Result of one service action
struct ActionResult {
    success: bool,
    message: String,
}

impl ActionResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Start, stop, or write through the device gateway on request.
///
/// Every command gets a reply on the coder topic, including unknown actions.
pub struct CoderServiceHandler {
    ctx: CoderContext,
}

impl CoderServiceHandler {
    /// Catalog name
    pub const NAME: &'static str = "CoderServiceHandler";
    /// Topic served when none is configured
    pub const DEFAULT_TOPIC: &'static str = "ios/v1/coder/service/start";

    /// Create the handler
    #[must_use]
    pub fn new(ctx: CoderContext) -> Self {
        Self { ctx }
    }

    async fn execute(&self, command: &ServiceCommand) -> ActionResult {
        let gateway = &self.ctx.gateway;
        match command.action.to_ascii_lowercase().as_str() {
            "start" | "connect" => match gateway.start().await {
                Ok(addr) => ActionResult::ok(format!("Coder gateway listening on {addr}")),
                Err(e) => ActionResult::failed(e.to_string()),
            },
            "stop" | "disconnect" => {
                if gateway.stop().await {
                    ActionResult::ok("Coder gateway stopped")
                } else {
                    ActionResult::ok("Coder gateway was not running")
                }
            }
            "send" => self.send(command).await,
            other => {
                warn!(action = %other, "Unknown coder service action");
                ActionResult::failed(format!("Unknown action: {other}"))
            }
        }
    }

    async fn send(&self, command: &ServiceCommand) -> ActionResult {
        let gateway = &self.ctx.gateway;
        if !gateway.is_running() {
            return ActionResult::failed(GatewayError::NotRunning.to_string());
        }

        let params = serde_json::Value::Object(command.parameters.clone().unwrap_or_default());
        let params: SendParameters = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(e) => return ActionResult::failed(format!("Invalid send parameters: {e}")),
        };

        match params.client_id {
            Some(raw) => {
                let sent = match Uuid::parse_str(&raw) {
                    Ok(id) => gateway.send_to(id, &params.data).await,
                    Err(_) => false,
                };
                if sent {
                    ActionResult::ok(format!("Sent to {raw}"))
                } else {
                    ActionResult::failed(GatewayError::ClientNotFound(raw).to_string())
                }
            }
            None => {
                let sent = gateway.broadcast(&params.data).await;
                let total = gateway.connected_client_count();
                ActionResult {
                    success: sent > 0,
                    message: format!("Sent to {sent} of {total} clients"),
                }
            }
        }
    }
}

#[async_trait]
impl MessageHandler for CoderServiceHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn supported_topics(&self) -> Vec<TopicPattern> {
        self.ctx.supported_topics("CoderService", Self::DEFAULT_TOPIC)
    }

    async fn process_message(&self, topic: &str, payload: &str) -> IosResult<()> {
        let command: ServiceCommand = match decode_payload(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Invalid coder service command, dropping");
                return Ok(());
            }
        };
        info!(command_id = %command.command_id, action = %command.action, "Coder service command");

        let store = &self.ctx.store;
        store.set(CorrelationKey::LastCoderServiceRequestTime, Utc::now());
        store.set(CorrelationKey::LastCoderServiceCommand, serde_json::to_value(&command)?);

        let started = Instant::now();
        let result = self.execute(&command).await;
        let execution_time = started.elapsed().as_secs_f64() * 1000.0;

        let outcome = ServiceOutcome {
            command_id: command.command_id,
            action: command.action,
            status: if result.success { "Success" } else { "Failed" }.to_string(),
            is_success: result.success,
            message: result.message,
            execution_time,
            timestamp: Utc::now(),
        };
        self.ctx
            .publisher
            .publish(TopicKey::Coder, SERVICE_COMPLETE, outcome)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::Harness;
    use serde_json::json;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    async fn run(harness: &mut Harness, command: serde_json::Value) -> serde_json::Value {
        let handler = CoderServiceHandler::new(harness.ctx.clone());
        handler
            .process_message(CoderServiceHandler::DEFAULT_TOPIC, &command.to_string())
            .await
            .unwrap();
        harness.expect("ios/v1/coder/service/complete").await
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let mut harness = Harness::new().await;

        let reply = run(&mut harness, json!({"CommandId": "c1", "Action": "start"})).await;
        assert_eq!(reply["messageType"], "coder_service_complete");
        assert_eq!(reply["data"]["CommandId"], "c1");
        assert_eq!(reply["data"]["Status"], "Success");
        assert!(harness.ctx.gateway.is_running());
        assert!(harness.ctx.store.contains(CorrelationKey::LastCoderServiceRequestTime));

        let reply = run(&mut harness, json!({"Action": "disconnect"})).await;
        assert_eq!(reply["data"]["IsSuccess"], true);
        assert!(!harness.ctx.gateway.is_running());
    }

    #[tokio::test]
    async fn test_unknown_action_reports_failure() {
        let mut harness = Harness::new().await;
        let reply = run(&mut harness, json!({"Action": "explode"})).await;
        assert_eq!(reply["data"]["Status"], "Failed");
        assert_eq!(reply["data"]["Message"], "Unknown action: explode");
    }

    #[tokio::test]
    async fn test_send_writes_to_devices() {
        let mut harness = Harness::new().await;
        let not_running = run(&mut harness, json!({"Action": "send", "Parameters": {"Data": "X"}})).await;
        assert_eq!(not_running["data"]["IsSuccess"], false);

        let gateway = harness.ctx.gateway.clone();
        let mut gateway_events = gateway.subscribe();
        let addr = gateway.start().await.unwrap();
        let mut device = TcpStream::connect(addr).await.unwrap();
        let id = loop {
            if let ios_gateway::GatewayEvent::ClientConnected(info) = gateway_events.recv().await.unwrap() {
                break info.id;
            }
        };

        let reply = run(
            &mut harness,
            json!({"Action": "send", "Parameters": {"ClientId": id.to_string(), "Data": "PRINT 1\n"}}),
        )
        .await;
        assert_eq!(reply["data"]["IsSuccess"], true);
        let mut buf = [0u8; 16];
        let n = device.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"PRINT 1\n");

        let reply = run(&mut harness, json!({"Action": "send", "Parameters": {"Data": "ALL\n"}})).await;
        assert_eq!(reply["data"]["Message"], "Sent to 1 of 1 clients");

        let reply = run(
            &mut harness,
            json!({"Action": "send", "Parameters": {"ClientId": "nope", "Data": "X"}}),
        )
        .await;
        assert_eq!(reply["data"]["Message"], "Client not found: nope");

        gateway.stop().await;
    }
}
