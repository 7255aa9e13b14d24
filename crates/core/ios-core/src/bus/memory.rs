//! In-process bus for tests and single-process runs.

use super::{BusClient, BusEvent, BusObserver, ObserverId, ObserverSet};
use crate::topic::{matches, validate_pattern, validate_topic};
use crate::{IosError, IosResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};
use uuid::Uuid;

/// Per-client state shared with the broker
#[derive(Debug)]
struct ClientState {
    name: String,
    connected: AtomicBool,
    subscriptions: RwLock<Vec<String>>,
    observers: ObserverSet,
}

impl ClientState {
    fn wants(&self, topic: &str) -> bool {
        self.connected.load(Ordering::SeqCst)
            && self.subscriptions.read().iter().any(|p| matches(topic, p))
    }
}

/// Routes messages between [`InMemoryBus`] clients with the same topic
/// semantics as a real broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    clients: Arc<RwLock<HashMap<Uuid, Arc<ClientState>>>>,
}

impl MemoryBroker {
    /// Creates a new broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attached clients
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    fn route(&self, topic: &str, payload: &str) -> usize {
        let targets: Vec<Arc<ClientState>> = self
            .clients
            .read()
            .values()
            .filter(|client| client.wants(topic))
            .cloned()
            .collect();

        let event = BusEvent::Message {
            topic: topic.to_string(),
            payload: payload.to_string(),
        };
        for client in &targets {
            trace!(client = %client.name, topic = %topic, "Delivering message");
            client.observers.notify(&event);
        }
        targets.len()
    }
}

/// A client of a [`MemoryBroker`]
#[derive(Debug)]
pub struct InMemoryBus {
    id: Uuid,
    broker: MemoryBroker,
    state: Arc<ClientState>,
}

impl InMemoryBus {
    /// Attach a new, disconnected client to `broker`
    #[must_use]
    pub fn new(broker: &MemoryBroker, name: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        let state = Arc::new(ClientState {
            name: name.into(),
            connected: AtomicBool::new(false),
            subscriptions: RwLock::new(Vec::new()),
            observers: ObserverSet::default(),
        });
        broker.clients.write().insert(id, Arc::clone(&state));

        Self {
            id,
            broker: broker.clone(),
            state,
        }
    }

    /// Current subscriptions
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.state.subscriptions.read().clone()
    }

    /// Number of registered observers
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.state.observers.len()
    }

    fn set_connected(&self, connected: bool) {
        if self.state.connected.swap(connected, Ordering::SeqCst) != connected {
            self.state.observers.notify(&BusEvent::ConnectionChanged(connected));
        }
    }
}

impl Drop for InMemoryBus {
    fn drop(&mut self) {
        self.broker.clients.write().remove(&self.id);
    }
}

#[async_trait]
impl BusClient for InMemoryBus {
    fn add_observer(&self, observer: BusObserver) -> ObserverId {
        self.state.observers.add(observer)
    }

    fn remove_observer(&self, id: ObserverId) -> bool {
        self.state.observers.remove(id)
    }

    async fn connect(&self) -> IosResult<()> {
        self.set_connected(true);
        info!(client = %self.state.name, "In-memory bus connected");
        Ok(())
    }

    async fn disconnect(&self) -> IosResult<()> {
        self.set_connected(false);
        info!(client = %self.state.name, "In-memory bus disconnected");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: String) -> IosResult<()> {
        if !self.is_connected() {
            return Err(IosError::bus(format!(
                "Cannot publish to '{topic}': client '{}' is not connected",
                self.state.name
            )));
        }
        validate_topic(topic)?;

        let delivered = self.broker.route(topic, &payload);
        debug!(client = %self.state.name, topic = %topic, delivered, "Published");
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> IosResult<()> {
        if !self.is_connected() {
            return Err(IosError::bus(format!(
                "Cannot subscribe to '{pattern}': client '{}' is not connected",
                self.state.name
            )));
        }
        validate_pattern(pattern)?;

        let mut subscriptions = self.state.subscriptions.write();
        if !subscriptions.iter().any(|p| p == pattern) {
            subscriptions.push(pattern.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, pattern: &str) -> IosResult<()> {
        self.state.subscriptions.write().retain(|p| p != pattern);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_routes_by_pattern() {
        let broker = MemoryBroker::new();
        let publisher = InMemoryBus::new(&broker, "publisher");
        let subscriber = InMemoryBus::new(&broker, "subscriber");
        let (tx, mut rx) = mpsc::unbounded_channel();
        subscriber.add_observer(tx);

        publisher.connect().await.unwrap();
        subscriber.connect().await.unwrap();
        subscriber.subscribe("ios/v1/+/camera/result").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), BusEvent::ConnectionChanged(true));

        publisher.publish("ios/v1/vision/camera/result", "{}".into()).await.unwrap();
        publisher.publish("ios/v1/vision/height/result", "{}".into()).await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            BusEvent::Message {
                topic: "ios/v1/vision/camera/result".into(),
                payload: "{}".into()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnected_client_receives_nothing() {
        let broker = MemoryBroker::new();
        let publisher = InMemoryBus::new(&broker, "publisher");
        let subscriber = InMemoryBus::new(&broker, "subscriber");
        let (tx, mut rx) = mpsc::unbounded_channel();

        publisher.connect().await.unwrap();
        subscriber.connect().await.unwrap();
        subscriber.subscribe("#").await.unwrap();
        subscriber.add_observer(tx);
        subscriber.disconnect().await.unwrap();

        publisher.publish("a/b", "x".into()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), BusEvent::ConnectionChanged(false));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rejects_wildcard_publish_and_bad_subscription() {
        let broker = MemoryBroker::new();
        let client = InMemoryBus::new(&broker, "client");
        client.connect().await.unwrap();

        assert!(matches!(
            client.publish("a/+", String::new()).await,
            Err(IosError::Topic(_))
        ));
        assert!(client.subscribe("a/#/b").await.is_err());
        assert!(client.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_drop_detaches_from_broker() {
        let broker = MemoryBroker::new();
        let client = InMemoryBus::new(&broker, "client");
        assert_eq!(broker.client_count(), 1);
        drop(client);
        assert_eq!(broker.client_count(), 0);
    }

    #[tokio::test]
    async fn test_health_check_follows_connection() {
        let broker = MemoryBroker::new();
        let client = InMemoryBus::new(&broker, "client");
        assert_err!(client.health_check().await);
        assert_ok!(client.connect().await);
        assert_ok!(client.health_check().await);
    }
}
