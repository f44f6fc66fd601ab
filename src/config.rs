//! Supervisor configuration.

use std::collections::HashSet;
use std::time::Duration;

use crate::address::DeviceAddress;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Default bound on a single device discovery.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(15);

/// Default label passed to every session.
pub const DEFAULT_SESSION_LABEL: &str = "MyBle5.0";

/// Default capacity of the update and event channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Configuration shared by every supervisor in a [`DeviceManager`](crate::DeviceManager).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SupervisorConfig {
    /// Devices to keep connected, one supervisor each.
    pub addresses: Vec<DeviceAddress>,
    /// Bound on a single discovery.
    pub scan_timeout: Duration,
    /// Idle delay policy between attempts.
    pub retry: RetryPolicy,
    /// Label handed to each session.
    pub session_label: String,
    /// Capacity of the device update channel.
    pub update_capacity: usize,
    /// Capacity of the supervisor event broadcast channel.
    pub event_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            retry: RetryPolicy::default(),
            session_label: DEFAULT_SESSION_LABEL.to_string(),
            update_capacity: DEFAULT_CHANNEL_CAPACITY,
            event_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl SupervisorConfig {
    /// Default configuration for the given devices.
    pub fn new(addresses: impl IntoIterator<Item = DeviceAddress>) -> Self {
        Self {
            addresses: addresses.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Parse every address string, failing on the first invalid one.
    pub fn from_strs<I, S>(addresses: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let addresses = addresses
            .into_iter()
            .map(|s| s.as_ref().parse::<DeviceAddress>())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self::new(addresses))
    }

    /// Set the scan timeout.
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the session label.
    pub fn with_session_label(mut self, label: impl Into<String>) -> Self {
        self.session_label = label.into();
        self
    }

    /// Set the update channel capacity.
    pub fn with_update_capacity(mut self, capacity: usize) -> Self {
        self.update_capacity = capacity;
        self
    }

    /// Set the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Check that the configuration can run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an empty or duplicated address
    /// list, a zero scan timeout, a zero retry cap or a zero channel capacity.
    pub fn validate(&self) -> Result<()> {
        if self.addresses.is_empty() {
            return Err(Error::invalid_config("no device addresses configured"));
        }

        let mut seen = HashSet::new();
        for address in &self.addresses {
            if !seen.insert(address) {
                return Err(Error::invalid_config(format!(
                    "duplicate device address {}",
                    address
                )));
            }
        }

        if self.scan_timeout.is_zero() {
            return Err(Error::invalid_config("scan timeout must be non-zero"));
        }
        if self.retry.max_retries == Some(0) {
            return Err(Error::invalid_config("retry cap must be at least 1"));
        }
        if self.update_capacity == 0 || self.event_capacity == 0 {
            return Err(Error::invalid_config("channel capacity must be non-zero"));
        }

        Ok(())
    }
}
