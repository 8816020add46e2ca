#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Treadbridge 🏃‍♀️
//!
//! Makes a Kingsmith WalkingPad treadmill usable from standard fitness apps
//! by bridging its proprietary Bluetooth Low Energy protocol to the
//! Bluetooth SIG Fitness Machine Service (FTMS).
//!
//! The bridge plays both BLE roles at once:
//!
//! - **Central** toward the treadmill ([`DeviceClient`], built on `btleplug`):
//!   connects, polls the treadmill for status and writes belt commands.
//! - **Peripheral** toward fitness apps ([`FitnessServer`], built on BlueZ via
//!   `bluer`): advertises an FTMS treadmill, notifies Treadmill Data and
//!   answers Fitness Machine Control Point requests.
//!
//! ## Vendor protocol
//!
//! The WalkingPad reuses FTMS-shaped UUIDs (0x1826 / 0x2ACD / 0x2AD9) but
//! speaks its own byte framing, so standard apps cannot talk to it directly.
//! See [`protocol`] for the frame layouts and [`ftms`] for the standard side.
//!
//! ## Safety Warning
//!
//! ⚠️ **Important**: fitness apps connected to the bridge can start the belt
//! and change its speed. Make sure the person on the treadmill expects that.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use treadbridge::{Bridge, BridgeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bridge = Arc::new(Bridge::new(BridgeConfig::default()).await?);
//!
//!     // Find the treadmill, connect, and start advertising FTMS
//!     let devices = bridge.scan(std::time::Duration::from_secs(5)).await?;
//!     if let Some(device) = devices.first() {
//!         if bridge.connect_treadmill(&device.address, Some(&device.name)).await {
//!             bridge.start_bridge().await;
//!         }
//!     }
//!
//!     // Or let the bridge find and reconnect the treadmill by itself
//!     bridge.run_auto_loop(None).await;
//!
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy link to the treadmill
pub mod ble;
/// Bridge orchestration and auto-discovery
pub mod bridge;
/// Error types and handling
pub mod error;
/// FTMS frame codecs and control point state machine
pub mod ftms;
/// WalkingPad vendor frame codecs
pub mod protocol;
/// FTMS GATT peripheral
pub mod server;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use ble::{DeviceClient, TreadmillLink};
pub use bridge::{Bridge, StatusRelay};
pub use error::{BridgeError, Result};
pub use server::{BluezPeripheral, FitnessServer, ServerEvent};
pub use types::{
    BridgeConfig, ConnectionState, ControlSession, DeviceCommand, DeviceStatus, DiscoveredDevice,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service the WalkingPad exposes for its vendor protocol
///
/// Same value as the standard Fitness Machine Service, which is how scans
/// recognise treadmill-like devices.
pub const DEVICE_SERVICE_UUID: uuid::Uuid =
    uuid::Uuid::from_u128(0x0000_1826_0000_1000_8000_0080_5f9b_34fb);

/// Characteristic carrying the WalkingPad's status notifications
pub const DEVICE_NOTIFY_CHAR_UUID: uuid::Uuid =
    uuid::Uuid::from_u128(0x0000_2acd_0000_1000_8000_0080_5f9b_34fb);

/// Characteristic accepting WalkingPad commands and status requests
pub const DEVICE_WRITE_CHAR_UUID: uuid::Uuid =
    uuid::Uuid::from_u128(0x0000_2ad9_0000_1000_8000_0080_5f9b_34fb);
