//! Connection session on top of btleplug.
//!
//! A [`BtleSession`] connects to one peripheral, subscribes to every
//! characteristic that can notify, and forwards decoded notifications on the
//! update channel. Disconnects are detected from the adapter's event stream.

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, CharPropFlags, Peripheral as _};
use btleplug::platform::{Adapter, Peripheral};
use futures::stream::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::address::DeviceAddress;
use crate::data::{DeviceUpdate, UpdateSender};
use crate::error::{Error, Result};
use crate::signal::DisconnectNotifier;
use crate::transport::{Decoder, Session};

/// One btleplug connection, owned by a single supervisor attempt.
pub struct BtleSession {
    /// Label the session was created with.
    label: String,
    /// Address of the device.
    address: DeviceAddress,
    /// The peripheral to communicate with.
    peripheral: Peripheral,
    /// Adapter the peripheral belongs to, for disconnect events.
    adapter: Adapter,
    /// Turns raw notifications into device data.
    decoder: Arc<dyn Decoder>,
    /// Where decoded updates go.
    updates: UpdateSender,
    /// Notification forwarding task.
    notification_task: Option<JoinHandle<()>>,
    /// Disconnect watcher task.
    disconnect_task: Option<JoinHandle<()>>,
    /// Whether `open` connected and `close` has not run yet.
    is_open: bool,
}

impl BtleSession {
    /// Create a session. Nothing happens on the air until [`Session::open`].
    pub fn new(
        label: impl Into<String>,
        address: DeviceAddress,
        peripheral: Peripheral,
        adapter: Adapter,
        decoder: Arc<dyn Decoder>,
        updates: UpdateSender,
    ) -> Self {
        Self {
            label: label.into(),
            address,
            peripheral,
            adapter,
            decoder,
            updates,
            notification_task: None,
            disconnect_task: None,
            is_open: false,
        }
    }

    /// Get the session label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Get the peripheral.
    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    /// Subscribe to every characteristic that notifies or indicates.
    async fn subscribe_all(&self) -> Result<usize> {
        let mut subscribed = 0;

        for characteristic in self.peripheral.characteristics() {
            if !characteristic
                .properties
                .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
            {
                continue;
            }

            debug!(
                "Subscribing to characteristic {} in service {}",
                characteristic.uuid, characteristic.service_uuid
            );
            self.peripheral
                .subscribe(&characteristic)
                .await
                .map_err(Error::Bluetooth)?;
            subscribed += 1;
        }

        Ok(subscribed)
    }

    fn abort_tasks(&mut self) {
        if let Some(handle) = self.notification_task.take() {
            handle.abort();
        }
        if let Some(handle) = self.disconnect_task.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Session for BtleSession {
    async fn open(&mut self) -> Result<()> {
        debug!("Connecting to {}", self.address);
        self.peripheral.connect().await.map_err(Error::Bluetooth)?;
        self.is_open = true;

        self.peripheral
            .discover_services()
            .await
            .map_err(Error::Bluetooth)?;

        // Take the stream before subscribing so the first notification is kept.
        let mut notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(Error::Bluetooth)?;

        let subscribed = self.subscribe_all().await?;
        if subscribed == 0 {
            warn!(
                "Device {} has no notifiable characteristics, no data will arrive",
                self.address
            );
        }

        let address = self.address;
        let label = self.label.clone();
        let decoder = self.decoder.clone();
        let updates = self.updates.clone();

        let handle = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                trace!(
                    "Notification from {}: {} bytes on {}",
                    address,
                    notification.value.len(),
                    notification.uuid
                );

                let Some(data) = decoder.decode(notification.uuid, &notification.value) else {
                    continue;
                };

                if updates
                    .send(DeviceUpdate::new(address, label.clone(), data))
                    .await
                    .is_err()
                {
                    debug!("Update receiver closed, stopping forwarding for {}", address);
                    break;
                }
            }

            debug!("Notification stream for {} ended", address);
        });

        self.notification_task = Some(handle);
        Ok(())
    }

    async fn watch_disconnect(&mut self, notifier: DisconnectNotifier) -> Result<()> {
        if let Some(handle) = self.disconnect_task.take() {
            handle.abort();
        }

        let mut events = self.adapter.events().await.map_err(Error::Bluetooth)?;

        // Catch a disconnect that happened before the event stream existed.
        if !self.peripheral.is_connected().await.map_err(Error::Bluetooth)? {
            notifier.notify();
            return Ok(());
        }

        let id = self.peripheral.id();
        let address = self.address;

        let handle = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(disconnected) = event {
                    if disconnected == id {
                        debug!("Adapter reported {} disconnected", address);
                        notifier.notify();
                        return;
                    }
                }
            }
            // The stream ending drops the notifier, which also wakes the waiter.
            debug!("Adapter event stream ended while watching {}", address);
        });

        self.disconnect_task = Some(handle);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.abort_tasks();

        if !self.is_open {
            return Ok(());
        }
        self.is_open = false;

        if self.peripheral.is_connected().await.unwrap_or(false) {
            self.peripheral
                .disconnect()
                .await
                .map_err(Error::Bluetooth)?;
            debug!("Disconnected from {}", self.address);
        }

        Ok(())
    }
}

impl Drop for BtleSession {
    fn drop(&mut self) {
        self.abort_tasks();

        if !self.is_open {
            return;
        }

        let peripheral = self.peripheral.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = peripheral.disconnect().await;
            });
        }
    }
}
