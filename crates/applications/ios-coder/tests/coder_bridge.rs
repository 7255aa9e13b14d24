//! Coder stage with a real TCP device over the in-memory bus.

use ios_core::{BusClient, BusEvent, CorrelationKey, CorrelationStore, InMemoryBus, Lifecycle, MemoryBroker};
use ios_coder::{assemble, CoderSettings};
use ios_gateway::GatewayConfig;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("ios_coder=debug,ios_gateway=debug")
        .with_test_writer()
        .try_init();
}

struct Monitor {
    bus: InMemoryBus,
    events: mpsc::UnboundedReceiver<BusEvent>,
}

impl Monitor {
    async fn attach(broker: &MemoryBroker) -> Self {
        let bus = InMemoryBus::new(broker, "monitor");
        bus.connect().await.unwrap();
        bus.subscribe("ios/#").await.unwrap();
        let (tx, events) = mpsc::unbounded_channel();
        bus.add_observer(tx);
        Self { bus, events }
    }

    async fn send(&self, topic: &str, payload: Value) {
        self.bus.publish(topic, payload.to_string()).await.unwrap();
    }

    /// Next envelope on `topic` whose message type is `message_type`
    async fn expect(&mut self, topic: &str, message_type: &str) -> Value {
        loop {
            let event = timeout(WAIT, self.events.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {message_type} on {topic}"))
                .expect("monitor channel closed");
            if let BusEvent::Message { topic: seen, payload } = event {
                if seen != topic {
                    continue;
                }
                let envelope: Value = serde_json::from_str(&payload).unwrap();
                if envelope["messageType"] == message_type {
                    return envelope;
                }
            }
        }
    }
}

#[tokio::test]
async fn test_device_round_trip_through_bus() {
    init_test_logging();
    let broker = MemoryBroker::new();
    let mut monitor = Monitor::attach(&broker).await;

    let store = CorrelationStore::new();
    let settings = CoderSettings {
        gateway: GatewayConfig::loopback(),
        ..CoderSettings::default()
    };
    let bus = Arc::new(InMemoryBus::new(&broker, "coder"));
    let (mut supervisor, gateway) = assemble(settings, bus, store.clone()).unwrap();
    supervisor.start().await.unwrap();

    loop {
        let status = monitor.expect("ios/v1/coder/status", "CoderStatus").await;
        if status["data"]["Status"] == "Server started" {
            assert_eq!(status["sender"], "ios-coder");
            break;
        }
    }

    // device connects and reads a code
    let addr = gateway.local_addr().await.unwrap();
    let mut device = TcpStream::connect(addr).await.unwrap();
    let connected = monitor.expect("ios/v1/coder/status", "ClientActivity").await;
    assert_eq!(connected["data"]["Action"], "Connected");
    assert_eq!(connected["data"]["TotalClients"], 1);
    let client_id = connected["data"]["ClientId"].as_str().unwrap().to_string();

    device.write_all(b"CODE-1\r\n").await.unwrap();
    let data = monitor.expect("ios/v1/coder/result", "CoderData").await;
    assert_eq!(data["data"]["Data"], "CODE-1");
    assert_eq!(data["data"]["ClientId"], client_id);
    assert_eq!(store.text(CorrelationKey::LastCoderData).as_deref(), Some("CODE-1"));

    // bus writes back to the device
    monitor
        .send(
            "ios/v1/coder/service/start",
            json!({"CommandId": "s-1", "Action": "send", "Parameters": {"ClientId": client_id, "Data": "MARK\n"}}),
        )
        .await;
    let outcome = monitor
        .expect("ios/v1/coder/service/complete", "coder_service_complete")
        .await;
    assert_eq!(outcome["data"]["CommandId"], "s-1");
    assert_eq!(outcome["data"]["IsSuccess"], true);
    let mut buf = [0u8; 16];
    let n = timeout(WAIT, device.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"MARK\n");

    // configuration is acknowledged
    monitor
        .send(
            "ios/v1/coder/config/set",
            json!({"CommandId": "c-1", "Configuration": {"MaxConnections": 4}}),
        )
        .await;
    let ack = monitor.expect("ios/v1/coder/status", "coder_config_response").await;
    assert_eq!(ack["data"]["Message"], "Configuration recorded");

    // stopping the stage closes the device connection
    supervisor.stop().await.unwrap();
    assert!(!gateway.is_running());
    let n = timeout(WAIT, device.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0);
    assert_eq!(store.flag(CorrelationKey::CoderIsRunning), Some(false));
}

#[tokio::test]
async fn test_stop_and_start_commands() {
    init_test_logging();
    let broker = MemoryBroker::new();
    let mut monitor = Monitor::attach(&broker).await;

    let settings = CoderSettings {
        gateway: GatewayConfig::loopback(),
        ..CoderSettings::default()
    };
    let bus = Arc::new(InMemoryBus::new(&broker, "coder"));
    let (mut supervisor, gateway) = assemble(settings, bus, CorrelationStore::new()).unwrap();
    supervisor.start().await.unwrap();

    monitor
        .send("ios/v1/coder/service/start", json!({"Action": "stop"}))
        .await;
    let outcome = monitor
        .expect("ios/v1/coder/service/complete", "coder_service_complete")
        .await;
    assert_eq!(outcome["data"]["Status"], "Success");
    assert!(!gateway.is_running());

    monitor
        .send("ios/v1/coder/service/start", json!({"action": "start"}))
        .await;
    let outcome = monitor
        .expect("ios/v1/coder/service/complete", "coder_service_complete")
        .await;
    assert_eq!(outcome["data"]["IsSuccess"], true);
    assert!(gateway.is_running());

    supervisor.stop().await.unwrap();
    assert!(!gateway.is_running());
}
