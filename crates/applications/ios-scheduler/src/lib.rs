//! # IOS Scheduler
//!
//! The scheduler stage reacts to each step of the physical line and publishes
//! the request that starts the next one:
//!
//! ```text
//! grating trigger ─▶ height/vision ─▶ camera result ─▶ motion ─▶ motion complete ─▶ coder ─▶ coder complete
//! ```
//!
//! There is no central state machine; the handlers share a
//! [`CorrelationStore`](ios_core::CorrelationStore) to relate timestamps across
//! stages and report per-stage and end-to-end latency.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod handlers;
pub mod payloads;
pub mod settings;
pub mod stage;

pub use handlers::PipelineContext;
pub use settings::SchedulerSettings;
pub use stage::{assemble, SchedulerStage};

/// Service name used as envelope sender and in status messages
pub const SERVICE_NAME: &str = "ios-scheduler";

/// Prefix of environment overrides, e.g. `IOS_SCHEDULER__BUS__BROKER`
pub const ENV_PREFIX: &str = "IOS_SCHEDULER";

/// Environment variable naming the settings file
pub const CONFIG_ENV: &str = "IOS_SCHEDULER_CONFIG";
