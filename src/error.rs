//! Error types for the ble-keepalive crate.

use thiserror::Error;

use crate::address::{DeviceAddress, ParseAddressError};

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// Failed to establish a connection to the device.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The current connection attempt was cancelled.
    #[error("Connection attempt cancelled")]
    Cancelled,

    /// A device address could not be parsed.
    #[error("Invalid device address: {0}")]
    InvalidAddress(#[from] ParseAddressError),

    /// The supervisor configuration is not usable.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of what is wrong with the configuration.
        reason: String,
    },

    /// The device manager was already started.
    #[error("Device manager already started")]
    AlreadyStarted,

    /// The retry policy's cap was hit before a connection succeeded.
    #[error("Gave up on {address} after {attempts} consecutive failed attempts")]
    RetriesExhausted {
        /// The device that could not be reached.
        address: DeviceAddress,
        /// Number of consecutive failed attempts.
        attempts: u32,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a [`Error::ConnectionFailed`] from anything printable.
    pub fn connection_failed(reason: impl std::fmt::Display) -> Self {
        Self::ConnectionFailed {
            reason: reason.to_string(),
        }
    }

    /// Build a [`Error::InvalidConfig`] from anything printable.
    pub fn invalid_config(reason: impl std::fmt::Display) -> Self {
        Self::InvalidConfig {
            reason: reason.to_string(),
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
