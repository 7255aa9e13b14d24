//! # IOS Coder
//!
//! The coder stage owns the TCP listener that code readers and markers
//! connect to. Frames read from devices are republished on the bus; bus
//! commands start and stop the listener or write back to devices.
//!
//! ```text
//! device ─tcp─▶ DeviceGateway ─events─▶ bridge ─▶ ios/v1/coder/result, ios/v1/coder/status
//! bus ─▶ CoderServiceHandler / CoderConfigHandler ─▶ DeviceGateway
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod bridge;
pub mod handlers;
pub mod payloads;
pub mod settings;
pub mod stage;

pub use handlers::CoderContext;
pub use settings::CoderSettings;
pub use stage::{assemble, CoderStage};

/// Service name used as envelope sender and in logs
pub const SERVICE_NAME: &str = "ios-coder";

/// Prefix of environment overrides, e.g. `IOS_CODER__GATEWAY__LISTEN_PORT`
pub const ENV_PREFIX: &str = "IOS_CODER";

/// Environment variable naming the settings file
pub const CONFIG_ENV: &str = "IOS_CODER_CONFIG";
