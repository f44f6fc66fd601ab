//! Device update messages and the logging consumer.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::info;

use crate::address::DeviceAddress;
use crate::data::DeviceData;

/// Sending side of the update channel, handed to each session.
pub type UpdateSender = mpsc::Sender<DeviceUpdate>;

/// Receiving side of the update channel.
pub type UpdateReceiver = mpsc::Receiver<DeviceUpdate>;

/// Latest payload reported by a connected device.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceUpdate {
    /// Device that produced the update.
    pub address: DeviceAddress,
    /// Session label the device was opened with.
    pub label: String,
    /// The new payload.
    pub data: DeviceData,
    /// When the update was received.
    pub received_at: DateTime<Utc>,
}

impl DeviceUpdate {
    /// Create an update stamped with the current time.
    pub fn new(address: DeviceAddress, label: impl Into<String>, data: DeviceData) -> Self {
        Self {
            address,
            label: label.into(),
            data,
            received_at: Utc::now(),
        }
    }
}

/// Log every update until all senders are gone. Returns the number of
/// updates logged.
pub async fn log_updates(mut rx: UpdateReceiver) -> u64 {
    let mut count = 0;
    while let Some(update) = rx.recv().await {
        info!(
            address = %update.address,
            label = %update.label,
            "Updated data: {}",
            update.data
        );
        count += 1;
    }
    count
}
