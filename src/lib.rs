// MIT License - Copyright (c) 2026 Peter Wright
// BlueBOLT CV2 client
//
//! # bluebolt-cv2
//!
//! Local control of Panamax and Furman power conditioners through their
//! BlueBOLT CV2 network card (XML over UDP, port 57010).
//!
//! The card's MAC address doubles as the authentication token. Only its first
//! six hex digits are ever written to logs or error messages.
//!
//! ## Quick Start
//!
//! ```no_run
//! use bluebolt_cv2::{BlueBoltDevice, DeviceConfig, DeviceMonitor, OutletCommand};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = DeviceConfig::builder()
//!         .host("192.168.0.162")
//!         .mac("10:65:a3:1b:2c:3d")
//!         .build()?;
//!
//!     let device = BlueBoltDevice::connect(config).await?;
//!     let monitor = DeviceMonitor::new(device);
//!
//!     let mut events = monitor.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     monitor.refresh().await?;
//!     monitor.set_outlet(OutletCommand::on(3)).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod event;
pub mod model;
pub mod monitor;
pub mod protocol;
pub mod status;
pub mod transport;
pub mod xml;

// Re-exports for convenience
pub use config::{AuthToken, DeviceConfig, DeviceConfigBuilder};
pub use device::BlueBoltDevice;
pub use error::{BlueBoltError, DeviceErrorCode, Result};
pub use event::{DeviceEvent, EventReceiver};
pub use model::{ControlKind, DeviceModel, ModelSpec, SensorField, SensorSet, MODEL_TABLE, detect_model};
pub use monitor::DeviceMonitor;
pub use protocol::Command;
pub use status::{DeviceInfo, OutletCommand, StatusReading};
pub use transport::{TransportStats, UdpTransport};
