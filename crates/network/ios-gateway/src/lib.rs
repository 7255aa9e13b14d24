//! # IOS Gateway
//!
//! Concurrent TCP gateway for line-oriented industrial devices such as code
//! readers. Devices connect to the gateway; every frame they send is raised as
//! a [`GatewayEvent`] that the owning stage bridges onto the message bus, and
//! the stage can write back to one device or to all of them.
//!
//! ```rust,no_run
//! use ios_gateway::{DeviceGateway, GatewayConfig, GatewayEvent};
//!
//! # async fn example() -> ios_gateway::Result<()> {
//! let gateway = DeviceGateway::new(GatewayConfig::loopback());
//! let mut events = gateway.subscribe();
//! let addr = gateway.start().await?;
//! println!("listening on {addr}");
//!
//! while let Ok(event) = events.recv().await {
//!     if let GatewayEvent::DataReceived(frame) = event {
//!         println!("{} sent {}", frame.endpoint, frame.data);
//!     }
//! }
//! gateway.stop().await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod events;
pub mod framing;
pub mod gateway;
pub mod stats;

pub use config::{Framing, GatewayConfig};
pub use error::{GatewayError, Result};
pub use events::{ClientInfo, DeviceFrame, GatewayEvent, GatewayStatus};
pub use framing::FrameDecoder;
pub use gateway::DeviceGateway;
pub use stats::GatewayStatsSnapshot;

/// Version information for the gateway library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_info() {
        assert!(!VERSION.is_empty());
    }

    #[tokio::test]
    async fn test_stop_when_not_running() {
        let gateway = DeviceGateway::new(GatewayConfig::loopback());
        assert!(!gateway.is_running());
        assert!(!gateway.stop().await);
        assert_eq!(gateway.local_addr().await, None);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let gateway = DeviceGateway::new(GatewayConfig {
            listen_address: "nowhere".into(),
            ..GatewayConfig::loopback()
        });
        assert!(matches!(gateway.start().await, Err(GatewayError::Configuration(_))));
        assert!(!gateway.is_running());
    }
}
