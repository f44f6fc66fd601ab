//! Device addresses.
//!
//! A [`DeviceAddress`] is the 6-byte hardware identifier of a target
//! peripheral. It is set once from configuration and never changes.

use btleplug::api::BDAddr;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A Bluetooth MAC address stored as a compact 6-byte array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    /// Create an address from its raw bytes, most significant first.
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn bytes(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Errors returned when parsing a device address string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseAddressError {
    /// Wrong number of octets.
    #[error("expected 6 octets, got {0}")]
    InvalidLength(usize),
    /// An octet is not two characters long.
    #[error("octet {0} has wrong length")]
    InvalidOctetLength(usize),
    /// An octet is not hexadecimal.
    #[error("'{0}' is not valid hex")]
    InvalidHex(String),
}

impl FromStr for DeviceAddress {
    type Err = ParseAddressError;

    /// Parse `AA:BB:CC:DD:EE:FF`. Lowercase and `-` separators are accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(ParseAddressError::InvalidLength(parts.len()));
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(ParseAddressError::InvalidOctetLength(i));
            }
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| ParseAddressError::InvalidHex(part.to_string()))?;
        }

        Ok(Self(bytes))
    }
}

impl From<[u8; 6]> for DeviceAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

impl From<BDAddr> for DeviceAddress {
    fn from(addr: BDAddr) -> Self {
        Self(addr.into_inner())
    }
}

impl From<DeviceAddress> for BDAddr {
    fn from(addr: DeviceAddress) -> Self {
        BDAddr::from(addr.0)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for DeviceAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for DeviceAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
