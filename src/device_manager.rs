//! Device manager for keeping a fixed set of devices connected.
//!
//! The manager launches one [`Supervisor`] per configured address. The
//! supervisors share nothing but the transport and the outbound channels; each
//! one runs, fails, and reconnects on its own schedule.

use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::address::DeviceAddress;
use crate::config::SupervisorConfig;
use crate::data::{UpdateReceiver, UpdateSender};
use crate::error::{Error, Result};
use crate::supervisor::{Supervisor, SupervisorEvent, SupervisorHandle};
use crate::transport::Transport;

/// Callback handle for unregistering callbacks.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// Central manager for the supervised devices.
pub struct DeviceManager<T: Transport> {
    /// Validated configuration.
    config: SupervisorConfig,
    /// Shared transport.
    transport: Arc<T>,
    /// Update sender, handed to supervisors on start.
    update_tx: Option<UpdateSender>,
    /// Supervisor event channel.
    event_tx: broadcast::Sender<SupervisorEvent>,
    /// Parent of every supervisor's shutdown token.
    shutdown: CancellationToken,
    /// Running supervisors.
    supervisors: Vec<(SupervisorHandle, JoinHandle<Result<()>>)>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
}

impl<T: Transport> DeviceManager<T> {
    /// Create a manager and the receiver that will carry device updates.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration does not validate.
    pub fn new(config: SupervisorConfig, transport: T) -> Result<(Self, UpdateReceiver)> {
        config.validate()?;

        let (update_tx, update_rx) = mpsc::channel(config.update_capacity);
        let (event_tx, _) = broadcast::channel(config.event_capacity);

        let manager = Self {
            config,
            transport: Arc::new(transport),
            update_tx: Some(update_tx),
            event_tx,
            shutdown: CancellationToken::new(),
            supervisors: Vec::new(),
            callback_counter: AtomicU64::new(0),
        };

        Ok((manager, update_rx))
    }

    /// Spawn one supervisor per configured address.
    ///
    /// Once every supervisor has stopped, the update receiver sees the end of
    /// the channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] if called more than once.
    pub fn start(&mut self) -> Result<()> {
        let update_tx = self.update_tx.take().ok_or(Error::AlreadyStarted)?;

        info!(
            "Starting {} supervisor(s): {}",
            self.config.addresses.len(),
            self.config
                .addresses
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );

        for address in &self.config.addresses {
            let supervisor = Supervisor::new(
                *address,
                self.transport.clone(),
                &self.config,
                update_tx.clone(),
                self.event_tx.clone(),
                self.shutdown.child_token(),
            );
            let handle = supervisor.handle();
            let task = tokio::spawn(supervisor.run());
            self.supervisors.push((handle, task));
        }

        Ok(())
    }

    /// Check if the supervisors were started.
    pub fn is_started(&self) -> bool {
        self.update_tx.is_none()
    }

    /// Get the configuration.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Get the shared transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Get the handle of the supervisor for `address`.
    pub fn handle(&self, address: &DeviceAddress) -> Option<SupervisorHandle> {
        self.supervisors
            .iter()
            .find(|(handle, _)| handle.address() == *address)
            .map(|(handle, _)| handle.clone())
    }

    /// Get every supervisor handle, in configuration order.
    pub fn handles(&self) -> Vec<SupervisorHandle> {
        self.supervisors
            .iter()
            .map(|(handle, _)| handle.clone())
            .collect()
    }

    /// Subscribe to supervisor events.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.event_tx.subscribe()
    }

    /// Register a callback for every supervisor event.
    pub fn on_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(SupervisorEvent) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.event_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Token that stops every supervisor when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop every supervisor at its next suspension point.
    pub fn shutdown(&self) {
        info!("Shutting down device manager");
        self.shutdown.cancel();
    }

    /// Wait for every supervisor to finish and return each one's result, in
    /// configuration order. Without a shutdown this waits forever.
    pub async fn join(mut self) -> Vec<(DeviceAddress, Result<()>)> {
        let (addresses, tasks): (Vec<_>, Vec<_>) = std::mem::take(&mut self.supervisors)
            .into_iter()
            .map(|(handle, task)| (handle.address(), task))
            .unzip();

        join_all(tasks)
            .await
            .into_iter()
            .zip(addresses)
            .map(|(joined, address)| {
                let result = joined.unwrap_or_else(|e| {
                    error!("Supervisor task for {} failed: {}", address, e);
                    Err(Error::Internal(format!("supervisor task failed: {}", e)))
                });
                (address, result)
            })
            .collect()
    }
}

impl<T: Transport> Drop for DeviceManager<T> {
    fn drop(&mut self) {
        // Supervisor tasks are detached and would otherwise outlive the manager.
        self.shutdown.cancel();
    }
}
