//! Data structures carried from connected devices to consumers.

pub mod device_data;
pub mod update;

pub use device_data::{DeviceData, FieldValue};
pub use update::{log_updates, DeviceUpdate, UpdateReceiver, UpdateSender};
