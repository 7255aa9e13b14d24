//! Core traits shared by the pipeline stages.

use crate::IosResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Load-time check of a settings section.
///
/// Bus, topic, message and gateway settings implement this; stage assembly
/// refuses to build from settings that fail it, reporting
/// [`IosError::Configuration`](crate::IosError::Configuration).
pub trait Validatable {
    /// First problem found, as a configuration error
    fn validate(&self) -> IosResult<()>;

    /// Whether [`validate`](Self::validate) passes
    fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

/// A stage process that owns a bus connection between start and stop
#[async_trait]
pub trait Lifecycle {
    /// Connect, subscribe and begin handling messages
    async fn start(&mut self) -> IosResult<()>;

    /// Tear down in reverse start order; a no-op when already stopped
    async fn stop(&mut self) -> IosResult<()>;

    /// Stop, then start again
    async fn restart(&mut self) -> IosResult<()> {
        self.stop().await?;
        self.start().await
    }

    /// Whether messages are being handled
    fn is_running(&self) -> bool {
        self.lifecycle_state() == LifecycleState::Running
    }

    /// Current state
    fn lifecycle_state(&self) -> LifecycleState;
}

/// Lifecycle states: `Stopped → Starting → Running → Stopping → Stopped`
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum LifecycleState {
    /// Not running; the initial and final state
    #[default]
    Stopped,
    /// Registering callbacks, connecting, subscribing
    Starting,
    /// Running normally
    Running,
    /// Tearing down in reverse order
    Stopping,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(name)
    }
}
