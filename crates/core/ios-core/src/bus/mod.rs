//! The bus client contract and the publishing capability handed to handlers.
//!
//! A [`BusClient`] owns one broker connection. Inbound messages and
//! connection changes are delivered as [`BusEvent`]s to every registered
//! observer channel; observers are independent and fire-and-forget.

mod memory;
mod mqtt;

pub use memory::{InMemoryBus, MemoryBroker};
pub use mqtt::MqttBus;

use crate::config::{MessageSettings, TopicKey, TopicSettings};
use crate::envelope::{Envelope, MessageType};
use crate::{IosError, IosResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Base delay between publish attempts
const PUBLISH_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Notification raised by a bus client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// A message arrived on a subscribed topic
    Message {
        /// Concrete topic
        topic: String,
        /// Raw payload text
        payload: String,
    },
    /// The broker connection went up (`true`) or down (`false`)
    ConnectionChanged(bool),
}

/// Channel an observer receives [`BusEvent`]s on
pub type BusObserver = mpsc::UnboundedSender<BusEvent>;

/// Handle returned by [`BusClient::add_observer`]
pub type ObserverId = Uuid;

/// Observer channels of one client
#[derive(Debug, Default)]
pub struct ObserverSet {
    observers: RwLock<HashMap<ObserverId, BusObserver>>,
}

impl ObserverSet {
    /// Register a channel
    pub fn add(&self, observer: BusObserver) -> ObserverId {
        let id = Uuid::new_v4();
        self.observers.write().insert(id, observer);
        id
    }

    /// Deregister a channel; false if unknown
    pub fn remove(&self, id: ObserverId) -> bool {
        self.observers.write().remove(&id).is_some()
    }

    /// Deliver `event` to every observer, dropping closed channels
    pub fn notify(&self, event: &BusEvent) {
        let mut closed = Vec::new();
        for (id, observer) in self.observers.read().iter() {
            if observer.send(event.clone()).is_err() {
                closed.push(*id);
            }
        }

        if !closed.is_empty() {
            let mut observers = self.observers.write();
            for id in closed {
                debug!(observer = %id, "Dropping closed bus observer");
                observers.remove(&id);
            }
        }
    }

    /// Number of registered observers
    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    /// Whether no observer is registered
    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }
}

/// Connection to a topic-addressed publish/subscribe broker
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Register an observer for messages and connection changes
    fn add_observer(&self, observer: BusObserver) -> ObserverId;

    /// Deregister an observer
    fn remove_observer(&self, id: ObserverId) -> bool;

    /// Connect to the broker
    async fn connect(&self) -> IosResult<()>;

    /// Disconnect from the broker
    async fn disconnect(&self) -> IosResult<()>;

    /// Publish a payload to a concrete topic
    async fn publish(&self, topic: &str, payload: String) -> IosResult<()>;

    /// Subscribe to a topic pattern
    async fn subscribe(&self, pattern: &str) -> IosResult<()>;

    /// Drop a subscription
    async fn unsubscribe(&self, pattern: &str) -> IosResult<()>;

    /// Whether the connection is currently up
    fn is_connected(&self) -> bool;

    /// Check that the client can currently publish
    async fn health_check(&self) -> IosResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(IosError::connection("Bus client is not connected"))
        }
    }
}

/// Publishes envelopes on behalf of one stage.
///
/// Topics are resolved by semantic key through the stage's publish map, so
/// deployments can remap them without code changes.
#[derive(Clone)]
pub struct StagePublisher {
    bus: Arc<dyn BusClient>,
    sender: String,
    topics: Arc<TopicSettings>,
    messages: Arc<MessageSettings>,
}

impl StagePublisher {
    /// Create a publisher for stage `sender`
    pub fn new(
        bus: Arc<dyn BusClient>,
        sender: impl Into<String>,
        topics: TopicSettings,
        messages: MessageSettings,
    ) -> Self {
        Self {
            bus,
            sender: sender.into(),
            topics: Arc::new(topics),
            messages: Arc::new(messages),
        }
    }

    /// Stage name stamped on envelopes
    #[must_use]
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Topic configuration
    #[must_use]
    pub fn topics(&self) -> &TopicSettings {
        &self.topics
    }

    /// Underlying bus client
    #[must_use]
    pub fn bus(&self) -> &Arc<dyn BusClient> {
        &self.bus
    }

    /// Wrap `data` in an envelope and publish it to the topic configured for
    /// `key`.
    ///
    /// Returns the topic used, or `None` when no topic is configured for the
    /// key (logged, not an error). Transient bus errors are retried up to
    /// `max_retries` times, each attempt bounded by the message timeout.
    pub async fn publish<T: Serialize + Send>(
        &self,
        key: TopicKey,
        message_type: impl Into<MessageType> + Send,
        data: T,
    ) -> IosResult<Option<String>> {
        let Some(topic) = self.topics.publish_topic(key) else {
            warn!(key = %key, "No publish topic configured, skipping message");
            return Ok(None);
        };
        let topic = topic.to_string();
        let payload = self.encode(message_type.into(), data)?;

        self.send(&topic, payload).await?;
        debug!(key = %key, topic = %topic, "Published message");
        Ok(Some(topic))
    }

    fn encode<T: Serialize>(&self, message_type: MessageType, data: T) -> IosResult<String> {
        let envelope = Envelope::new(message_type, self.sender.as_str(), data)
            .with_version(self.messages.version.as_str());
        if self.messages.enable_validation {
            envelope.validate()?;
        }
        envelope.to_json()
    }

    async fn send(&self, topic: &str, payload: String) -> IosResult<()> {
        let attempts = self.messages.max_retries.max(1);
        let timeout = self.messages.timeout();

        let mut attempt = 1;
        loop {
            let result = tokio::time::timeout(timeout, self.bus.publish(topic, payload.clone()))
                .await
                .unwrap_or_else(|_| Err(IosError::timeout(format!("Publish to '{topic}' timed out"))));

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(topic = %topic, attempt, error = %e, "Publish failed, retrying");
                    tokio::time::sleep(PUBLISH_RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl fmt::Debug for StagePublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagePublisher")
            .field("sender", &self.sender)
            .field("topics", &self.topics)
            .field("connected", &self.bus.is_connected())
            .finish()
    }
}
