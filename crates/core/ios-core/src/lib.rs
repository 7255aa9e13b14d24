//! # IOS Core
//!
//! Shared infrastructure for the IOS pipeline stages. Every stage is an
//! independent process that talks to the others only through a
//! topic-addressed publish/subscribe bus; this crate provides the pieces each
//! of them is assembled from.
//!
//! ## Features
//!
//! - **Topic Matching**: MQTT-style `+`/`#` wildcard semantics
//! - **Dispatch**: handler registry with exact-then-pattern-then-default
//!   priority, naming-convention discovery, and failure isolation
//! - **Bus Clients**: one contract with an MQTT and an in-memory implementation
//! - **Lifecycle**: ordered start/stop supervision around per-stage logic
//! - **Correlation**: concurrent cross-handler pipeline state
//! - **Configuration and Logging**: layered settings and tracing setup
//!
//! ## Quick Start
//!
//! ```rust
//! use ios_core::handler::{HandlerRegistry, Resolution};
//!
//! let registry = HandlerRegistry::default();
//! assert_eq!(registry.resolve("ios/v1/sensor/grating/trigger"), Resolution::Default);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bus;
pub mod config;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod logging;
pub mod shutdown;
pub mod topic;
pub mod traits;

// Re-export commonly used items
pub use bus::{BusClient, BusEvent, InMemoryBus, MemoryBroker, MqttBus, StagePublisher};
pub use config::{BusSettings, MessageSettings, TopicKey, TopicSettings};
pub use correlation::{CorrelationKey, CorrelationStore, CorrelationValue};
pub use envelope::{Envelope, MessageType};
pub use error::{IosError, IosResult};
pub use handler::{Dispatcher, HandlerCatalog, HandlerFactory, HandlerRegistry, MessageHandler};
pub use lifecycle::{LifecycleSupervisor, Stage};
pub use topic::TopicPattern;
pub use traits::{Lifecycle, LifecycleState, Validatable};

/// Version information for the IOS Core library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The name of the IOS Core library
pub const NAME: &str = env!("CARGO_PKG_NAME");
