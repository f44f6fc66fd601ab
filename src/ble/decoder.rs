//! Default notification decoder.

use std::collections::HashSet;
use uuid::Uuid;

use crate::data::DeviceData;
use crate::transport::Decoder;

/// Passes notifications through undecoded: one field named after the
/// characteristic UUID holding the raw bytes.
#[derive(Debug, Clone, Default)]
pub struct RawDecoder {
    /// Only these characteristics are forwarded. Empty means all.
    characteristics: HashSet<Uuid>,
}

impl RawDecoder {
    /// Forward notifications from every characteristic.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward notifications only from the given characteristics.
    pub fn for_characteristics(characteristics: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            characteristics: characteristics.into_iter().collect(),
        }
    }
}

impl Decoder for RawDecoder {
    fn decode(&self, characteristic: Uuid, value: &[u8]) -> Option<DeviceData> {
        if !self.characteristics.is_empty() && !self.characteristics.contains(&characteristic) {
            return None;
        }
        Some(DeviceData::new().with(characteristic.to_string(), value.to_vec()))
    }
}

impl<F> Decoder for F
where
    F: Fn(Uuid, &[u8]) -> Option<DeviceData> + Send + Sync,
{
    fn decode(&self, characteristic: Uuid, value: &[u8]) -> Option<DeviceData> {
        self(characteristic, value)
    }
}
