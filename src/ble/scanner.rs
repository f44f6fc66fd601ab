//! Address-based discovery on top of btleplug.
//!
//! [`BtleTransport`] is the default [`Transport`]. Several supervisors share
//! one transport and may scan at the same time, so scanning is reference
//! counted: the adapter scan starts with the first search and stops after the
//! last one finishes.

use async_trait::async_trait;
use btleplug::api::{BDAddr, Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::future::{self, Future};
use futures::stream::{Stream, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

use crate::address::DeviceAddress;
use crate::ble::decoder::RawDecoder;
use crate::ble::session::BtleSession;
use crate::data::UpdateSender;
use crate::error::{Error, Result};
use crate::transport::{Decoder, Transport};

/// btleplug-backed transport.
///
/// On macOS CoreBluetooth hides peripheral MAC addresses, so address-based
/// discovery only works on Linux and Windows.
pub struct BtleTransport {
    /// The BLE adapter to use for scanning.
    adapter: Adapter,
    /// Decoder handed to every session.
    decoder: Arc<dyn Decoder>,
    /// Number of searches currently relying on the adapter scan.
    active_scans: Arc<Mutex<usize>>,
}

impl BtleTransport {
    /// Create a transport on the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Create a transport on a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            decoder: Arc::new(RawDecoder::new()),
            active_scans: Arc::new(Mutex::new(0)),
        }
    }

    /// Replace the notification decoder.
    pub fn with_decoder(mut self, decoder: impl Decoder + 'static) -> Self {
        self.decoder = Arc::new(decoder);
        self
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Start the adapter scan unless another search already did. The scan
    /// is released when the returned guard drops, even if the search future
    /// is cancelled midway.
    async fn begin_scan(&self) -> Result<ScanGuard> {
        let first = {
            let mut active = self.active_scans.lock();
            *active += 1;
            *active == 1
        };
        let guard = ScanGuard {
            adapter: self.adapter.clone(),
            active_scans: self.active_scans.clone(),
        };

        if first {
            debug!("Starting BLE scan");
            self.adapter
                .start_scan(ScanFilter::default())
                .await
                .map_err(Error::Bluetooth)?;
        }
        Ok(guard)
    }

    /// Wait until the scan reports a peripheral with `target`.
    ///
    /// The adapter's peripheral list is not consulted: BlueZ keeps devices
    /// there long after they went out of range.
    async fn wait_for<S>(&self, target: BDAddr, events: S) -> Option<Peripheral>
    where
        S: Stream<Item = CentralEvent>,
    {
        let ids = events.filter_map(|event| future::ready(advertised_id(event)));

        first_with_address(ids, target, |id| async move {
            match self.adapter.peripheral(&id).await {
                Ok(peripheral) => Some((peripheral.address(), peripheral)),
                Err(e) => {
                    trace!("Failed to get peripheral {:?}: {}", id, e);
                    None
                }
            }
        })
        .await
    }
}

/// Peripheral seen on the air by this scan.
fn advertised_id(event: CentralEvent) -> Option<PeripheralId> {
    match event {
        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => Some(id),
        _ => None,
    }
}

/// Resolve each id in turn and return the first peripheral at `target`.
async fn first_with_address<S, F, Fut, P>(ids: S, target: BDAddr, mut lookup: F) -> Option<P>
where
    S: Stream,
    F: FnMut(S::Item) -> Fut,
    Fut: Future<Output = Option<(BDAddr, P)>>,
{
    futures::pin_mut!(ids);
    while let Some(id) = ids.next().await {
        if let Some((address, peripheral)) = lookup(id).await {
            if address == target {
                return Some(peripheral);
            }
        }
    }
    None
}

/// Keeps the adapter scan alive while held.
struct ScanGuard {
    adapter: Adapter,
    active_scans: Arc<Mutex<usize>>,
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        let last = {
            let mut active = self.active_scans.lock();
            *active = active.saturating_sub(1);
            *active == 0
        };
        if !last {
            return;
        }

        let adapter = self.adapter.clone();
        let active_scans = self.active_scans.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                // A new search may have started in the meantime.
                if *active_scans.lock() > 0 {
                    return;
                }
                debug!("Stopping BLE scan");
                if let Err(e) = adapter.stop_scan().await {
                    debug!("Failed to stop scan: {}", e);
                }
            });
        }
    }
}

#[async_trait]
impl Transport for BtleTransport {
    type Peripheral = Peripheral;
    type Session = BtleSession;

    async fn find_device(
        &self,
        address: &DeviceAddress,
        timeout: Duration,
    ) -> Result<Option<Peripheral>> {
        let target = BDAddr::from(*address);

        // Subscribe before scanning so no discovery event is missed.
        let events = self.adapter.events().await.map_err(Error::Bluetooth)?;
        let _scan = self.begin_scan().await?;

        let found = tokio::time::timeout(timeout, self.wait_for(target, events))
            .await
            .ok()
            .flatten();

        Ok(found)
    }

    fn create_session(
        &self,
        label: &str,
        address: DeviceAddress,
        peripheral: Peripheral,
        updates: UpdateSender,
    ) -> BtleSession {
        BtleSession::new(
            label,
            address,
            peripheral,
            self.adapter.clone(),
            self.decoder.clone(),
            updates,
        )
    }
}
