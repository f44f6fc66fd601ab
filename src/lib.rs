//! # ble-keepalive
//!
//! Keeps persistent Bluetooth Low Energy connections to a fixed set of
//! peripherals and forwards the data they report.
//!
//! Every configured device gets its own supervisor that loops forever:
//! scan for the device by address, open a session, wait until the device
//! disconnects, pause, and start over. Failures of any kind are logged and
//! retried; supervisors for different devices never wait on each other.
//!
//! ## Features
//!
//! - **Automatic reconnect**: fixed or exponential retry delay, optional
//!   jitter and retry cap
//! - **Concurrent supervisors**: one independent task per device address
//! - **Data forwarding**: decoded notifications arrive on a bounded channel
//! - **Pluggable transport**: `btleplug` by default, any [`Transport`] for
//!   tests or other stacks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_keepalive::{log_updates, BtleTransport, DeviceManager, Result, SupervisorConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<()> {
//!     let config = SupervisorConfig::from_strs(["CF:E2:17:57:36:B9"])?;
//!     let transport = BtleTransport::new().await?;
//!
//!     let (mut manager, updates) = DeviceManager::new(config, transport)?;
//!     tokio::spawn(log_updates(updates));
//!
//!     manager.start()?;
//!     for (address, result) in manager.join().await {
//!         println!("{}: {:?}", address, result);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! CoreBluetooth does not expose peripheral MAC addresses, so the default
//! transport cannot find devices by address there.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for configuration and data types

pub mod address;
pub mod ble;
pub mod config;
pub mod data;
pub mod device_manager;
pub mod error;
pub mod retry;
pub mod signal;
pub mod supervisor;
pub mod transport;

// Re-exports for convenience
pub use address::{DeviceAddress, ParseAddressError};
pub use ble::{BtleSession, BtleTransport, RawDecoder};
pub use config::SupervisorConfig;
pub use data::{log_updates, DeviceData, DeviceUpdate, FieldValue, UpdateReceiver, UpdateSender};
pub use device_manager::{CallbackHandle, DeviceManager};
pub use error::{Error, Result};
pub use retry::{Backoff, BackoffStrategy, RetryPolicy};
pub use signal::{DisconnectNotifier, DisconnectReason, DisconnectSignal};
pub use supervisor::{
    ConnectionState, Supervisor, SupervisorEvent, SupervisorEventKind, SupervisorHandle,
};
pub use transport::{Decoder, Session, Transport};
