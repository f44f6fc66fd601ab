//! Collaborator seams.
//!
//! The supervisor only talks to the BLE stack through these traits. The
//! [`ble`](crate::ble) module implements them on top of `btleplug`; tests
//! implement them with scripted fakes.

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::address::DeviceAddress;
use crate::data::{DeviceData, UpdateSender};
use crate::error::Result;
use crate::signal::DisconnectNotifier;

/// Address-based discovery and session construction.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Handle to a discovered peripheral.
    type Peripheral: Send + 'static;

    /// Connection session built around a discovered peripheral.
    type Session: Session + 'static;

    /// Search for the device with the given address.
    ///
    /// Returns `Ok(None)` if it was not seen within `timeout`. The supervisor
    /// also bounds this call by `timeout`.
    async fn find_device(
        &self,
        address: &DeviceAddress,
        timeout: Duration,
    ) -> Result<Option<Self::Peripheral>>;

    /// Build a session for a discovered peripheral. The session sends every
    /// decoded notification on `updates`.
    fn create_session(
        &self,
        label: &str,
        address: DeviceAddress,
        peripheral: Self::Peripheral,
        updates: UpdateSender,
    ) -> Self::Session;
}

/// One connection to one device, owned by a single attempt.
///
/// Dropping a session must release the underlying connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Session: Send {
    /// Connect and start forwarding device data.
    async fn open(&mut self) -> Result<()>;

    /// Register the notifier to fire when the transport reports that the
    /// connection is gone. If the link is already down, fire immediately.
    async fn watch_disconnect(&mut self, notifier: DisconnectNotifier) -> Result<()>;

    /// Stop forwarding data and disconnect.
    async fn close(&mut self) -> Result<()>;
}

/// Turns raw characteristic notifications into device data.
#[cfg_attr(test, mockall::automock)]
pub trait Decoder: Send + Sync {
    /// Decode one notification. `None` drops it.
    fn decode(&self, characteristic: Uuid, value: &[u8]) -> Option<DeviceData>;
}
