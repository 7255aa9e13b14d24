//! MQTT bus client on `rumqttc`.
//!
//! A background task drives the `rumqttc` event loop. The first connection
//! attempt is bounded by the configured timeout and its failure is returned
//! from [`BusClient::connect`]. After a drop the first retry waits the
//! reconnect delay and later ones the reconnect interval. On each fresh
//! `ConnAck` the client re-subscribes its patterns from a separate task and
//! raises a connection-changed notification.

use super::{BusClient, BusEvent, BusObserver, ObserverId, ObserverSet};
use crate::config::BusSettings;
use crate::topic::{validate_pattern, validate_topic};
use crate::{IosError, IosResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on waiting for the event loop task to finish on disconnect
const EVENT_LOOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct Shared {
    connected: AtomicBool,
    subscriptions: RwLock<Vec<String>>,
    observers: ObserverSet,
}

impl Shared {
    fn set_connected(&self, connected: bool) {
        if self.connected.swap(connected, Ordering::SeqCst) != connected {
            self.observers.notify(&BusEvent::ConnectionChanged(connected));
        }
    }
}

struct Session {
    client: AsyncClient,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Bus client for an MQTT broker
pub struct MqttBus {
    settings: BusSettings,
    client_id: String,
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
}

impl MqttBus {
    /// Create a disconnected client. Without a configured client id one is
    /// generated from `stage`.
    #[must_use]
    pub fn new(settings: BusSettings, stage: &str) -> Self {
        let client_id = settings
            .client_id
            .clone()
            .unwrap_or_else(|| format!("{stage}-{}", uuid::Uuid::new_v4().simple()));

        Self {
            settings,
            client_id,
            shared: Arc::new(Shared::default()),
            session: Mutex::new(None),
        }
    }

    /// MQTT client id
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Build the `rumqttc` options for this client
    #[must_use]
    pub fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.client_id.clone(),
            self.settings.broker.clone(),
            self.settings.port,
        );
        options.set_keep_alive(self.settings.keep_alive());
        options.set_clean_session(self.settings.clean_session);
        if let Some(username) = &self.settings.username {
            options.set_credentials(
                username.clone(),
                self.settings.password.clone().unwrap_or_default(),
            );
        }
        options
    }

    async fn client(&self) -> IosResult<AsyncClient> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.client.clone())
            .ok_or_else(|| IosError::bus("MQTT client is not connected"))
    }
}

#[async_trait]
impl BusClient for MqttBus {
    fn add_observer(&self, observer: BusObserver) -> ObserverId {
        self.shared.observers.add(observer)
    }

    fn remove_observer(&self, id: ObserverId) -> bool {
        self.shared.observers.remove(id)
    }

    async fn connect(&self) -> IosResult<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            debug!(client_id = %self.client_id, "MQTT client already connected");
            return Ok(());
        }

        info!(
            broker = %self.settings.broker,
            port = self.settings.port,
            client_id = %self.client_id,
            "Connecting to MQTT broker"
        );

        let (client, eventloop) =
            AsyncClient::new(self.mqtt_options(), self.settings.channel_capacity);
        let cancel = CancellationToken::new();
        let (first_tx, first_rx) = oneshot::channel();

        let task = tokio::spawn(drive_event_loop(
            eventloop,
            client.clone(),
            Arc::clone(&self.shared),
            cancel.clone(),
            ReconnectBackoff::new(self.settings.reconnect_delay(), self.settings.reconnect_interval()),
            first_tx,
        ));

        let first = tokio::time::timeout(self.settings.connection_timeout(), first_rx).await;
        let failure = match first {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(reason))) => Some(IosError::connection(format!(
                "MQTT connect to {}:{} failed: {reason}",
                self.settings.broker, self.settings.port
            ))),
            Ok(Err(_)) => Some(IosError::connection("MQTT event loop ended before connecting")),
            Err(_) => Some(IosError::timeout(format!(
                "MQTT connect to {}:{} timed out after {:?}",
                self.settings.broker,
                self.settings.port,
                self.settings.connection_timeout()
            ))),
        };

        if let Some(e) = failure {
            cancel.cancel();
            task.abort();
            error!(error = %e, "MQTT connect failed");
            return Err(e);
        }

        *session = Some(Session {
            client,
            cancel,
            task,
        });
        Ok(())
    }

    async fn disconnect(&self) -> IosResult<()> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };

        if let Err(e) = session.client.disconnect().await {
            warn!(error = %e, "MQTT disconnect request failed");
        }
        // let the event loop flush the DISCONNECT before cancelling it
        tokio::task::yield_now().await;
        session.cancel.cancel();
        if tokio::time::timeout(EVENT_LOOP_JOIN_TIMEOUT, session.task).await.is_err() {
            warn!("MQTT event loop did not stop in time");
        }

        self.shared.set_connected(false);
        info!(client_id = %self.client_id, "Disconnected from MQTT broker");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: String) -> IosResult<()> {
        validate_topic(topic)?;
        let client = self.client().await?;
        client
            .publish(topic, QoS::AtLeastOnce, false, payload.into_bytes())
            .await
            .map_err(|e| IosError::bus(format!("Publish to '{topic}' failed: {e}")))
    }

    async fn subscribe(&self, pattern: &str) -> IosResult<()> {
        validate_pattern(pattern)?;
        let client = self.client().await?;
        client
            .subscribe(pattern, QoS::AtLeastOnce)
            .await
            .map_err(|e| IosError::bus(format!("Subscribe to '{pattern}' failed: {e}")))?;

        let mut subscriptions = self.shared.subscriptions.write();
        if !subscriptions.iter().any(|p| p == pattern) {
            subscriptions.push(pattern.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, pattern: &str) -> IosResult<()> {
        self.shared.subscriptions.write().retain(|p| p != pattern);
        let client = self.client().await?;
        client
            .unsubscribe(pattern)
            .await
            .map_err(|e| IosError::bus(format!("Unsubscribe from '{pattern}' failed: {e}")))
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

/// Delay before each reconnect attempt of one outage
#[derive(Debug, Clone)]
struct ReconnectBackoff {
    first: Duration,
    interval: Duration,
    failures: u32,
}

impl ReconnectBackoff {
    fn new(first: Duration, interval: Duration) -> Self {
        Self {
            first,
            interval,
            failures: 0,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = if self.failures == 0 { self.first } else { self.interval };
        self.failures = self.failures.saturating_add(1);
        delay
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    mut backoff: ReconnectBackoff,
    first_tx: oneshot::Sender<Result<(), String>>,
) {
    let mut first = Some(first_tx);

    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    let reason = format!("broker refused connection: {:?}", ack.code);
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Err(reason));
                        break;
                    }
                    warn!(reason = %reason, "MQTT reconnect refused");
                    continue;
                }

                info!("MQTT connection established");
                backoff.reset();
                spawn_resubscribe(&client, &shared, &cancel);
                shared.set_connected(true);
                if let Some(tx) = first.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                shared.observers.notify(&BusEvent::Message {
                    topic: publish.topic,
                    payload,
                });
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker closed the MQTT session");
                shared.set_connected(false);
            }
            Ok(_) => {}
            Err(e) => {
                if let Some(tx) = first.take() {
                    let _ = tx.send(Err(e.to_string()));
                    break;
                }

                shared.set_connected(false);
                let delay = backoff.next_delay();
                warn!(error = %e, retry_in = ?delay, "MQTT connection lost");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    shared.set_connected(false);
    debug!("MQTT event loop stopped");
}

/// Re-request every stored pattern. The requests wait for room in the
/// client's request channel, so they run beside the event loop that drains it.
fn spawn_resubscribe(client: &AsyncClient, shared: &Shared, cancel: &CancellationToken) {
    let patterns = shared.subscriptions.read().clone();
    if patterns.is_empty() {
        return;
    }

    let client = client.clone();
    tokio::spawn(resubscribe(patterns, cancel.child_token(), move |pattern| {
        let client = client.clone();
        async move {
            client
                .subscribe(pattern, QoS::AtLeastOnce)
                .await
                .map_err(|e| e.to_string())
        }
    }));
}

async fn resubscribe<F, Fut>(patterns: Vec<String>, cancel: CancellationToken, mut subscribe: F) -> usize
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<(), String>>,
{
    let mut restored = 0;
    for pattern in patterns {
        let result = tokio::select! {
            () = cancel.cancelled() => break,
            result = subscribe(pattern.clone()) => result,
        };
        match result {
            Ok(()) => {
                debug!(pattern = %pattern, "Re-subscribed");
                restored += 1;
            }
            Err(e) => warn!(pattern = %pattern, error = %e, "Re-subscribe failed"),
        }
    }
    restored
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;

    #[test]
    fn test_generated_client_id() {
        let bus = MqttBus::new(BusSettings::default(), "ios-scheduler");
        assert!(bus.client_id().starts_with("ios-scheduler-"));
        assert!(!bus.is_connected());
    }

    #[test]
    fn test_options_from_settings() {
        let settings = BusSettings {
            broker: "10.1.2.3".into(),
            port: 1884,
            client_id: Some("coder-1".into()),
            username: Some("plant".into()),
            password: Some("secret".into()),
            keep_alive_secs: 15,
            clean_session: false,
            ..BusSettings::default()
        };
        let bus = MqttBus::new(settings, "ios-coder");
        let options = bus.mqtt_options();

        assert_eq!(options.client_id(), "coder-1");
        assert_eq!(options.broker_address(), ("10.1.2.3".to_string(), 1884));
        assert_eq!(options.keep_alive(), Duration::from_secs(15));
        assert!(!options.clean_session());
        assert_eq!(
            options.credentials(),
            Some(("plant".to_string(), "secret".to_string()))
        );
    }

    #[tokio::test]
    async fn test_publish_before_connect_is_a_bus_error() {
        let bus = MqttBus::new(BusSettings::default(), "ios-test");
        let err = bus.publish("ios/v1/a", "{}".into()).await.unwrap_err();
        assert!(matches!(err, IosError::Bus(_)));
        assert!(bus.health_check().await.is_err());
        assert!(bus.disconnect().await.is_ok());
    }

    #[test]
    fn test_backoff_uses_delay_then_interval() {
        let settings = BusSettings {
            reconnect_delay_ms: 250,
            reconnect_interval_secs: 5,
            ..BusSettings::default()
        };
        let mut backoff = ReconnectBackoff::new(settings.reconnect_delay(), settings.reconnect_interval());

        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_resubscribe_requests_every_pattern() {
        let requested = Arc::new(SyncMutex::new(Vec::new()));
        let seen = Arc::clone(&requested);
        let patterns = vec![
            "ios/v1/sensor/+/trigger".to_string(),
            "ios/v1/vision/#".to_string(),
            "ios/v1/coder/service/complete".to_string(),
        ];

        let restored = resubscribe(patterns.clone(), CancellationToken::new(), move |pattern| {
            seen.lock().push(pattern.clone());
            async move {
                if pattern == "ios/v1/vision/#" {
                    Err("request channel closed".to_string())
                } else {
                    tokio::task::yield_now().await;
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(restored, 2);
        assert_eq!(*requested.lock(), patterns);
    }

    #[tokio::test]
    async fn test_resubscribe_waits_for_a_busy_channel() {
        let (gate_tx, gate_rx) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(resubscribe(
            vec!["ios/v1/a".to_string(), "ios/v1/b".to_string()],
            CancellationToken::new(),
            move |_pattern| {
                let mut gate = gate_rx.clone();
                async move {
                    gate.wait_for(|open| *open).await.map_err(|e| e.to_string())?;
                    Ok(())
                }
            },
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        gate_tx.send(true).unwrap();
        assert_eq!(task.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_resubscribe_stops_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let restored = resubscribe(vec!["ios/v1/a".to_string()], cancel, |_pattern| {
            std::future::pending::<Result<(), String>>()
        })
        .await;
        assert_eq!(restored, 0);
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let settings = BusSettings {
            broker: "127.0.0.1".into(),
            port: 1,
            connection_timeout_secs: 5,
            ..BusSettings::default()
        };
        let bus = MqttBus::new(settings, "ios-test");
        let err = bus.connect().await.unwrap_err();
        assert!(err.is_startup_fatal());
        assert!(!bus.is_connected());
    }
}
