// Device-type classification and per-type output latency estimation.
//
// Classification is a fixed, priority-ordered substring match over the
// device's name and description. The latency table is a configuration
// surface so tests and future measured values can override the defaults.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Device-type classification derived from sink name/description text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Bluetooth,
    Monitor,
    Usb,
    Headphones,
    Speakers,
    Digital,
    Unknown,
}

impl DeviceType {
    /// Classify a device from its name and description.
    ///
    /// Checked in priority order, first match wins. Bluetooth comes first
    /// because many bluetooth devices also match the headphone keywords.
    pub fn classify(name: &str, description: &str) -> Self {
        let haystack = format!("{} {}", name.to_lowercase(), description.to_lowercase());
        let matches_any = |keywords: &[&str]| keywords.iter().any(|kw| haystack.contains(kw));

        if matches_any(&["bluetooth", "wireless", "bluez"]) {
            DeviceType::Bluetooth
        } else if matches_any(&["hdmi", "displayport"]) {
            DeviceType::Monitor
        } else if matches_any(&["usb"]) {
            DeviceType::Usb
        } else if matches_any(&["headphone", "headset"]) {
            DeviceType::Headphones
        } else if matches_any(&["digital", "optical", "spdif", "s/pdif"]) {
            DeviceType::Digital
        } else if matches_any(&["speaker", "analog"]) {
            DeviceType::Speakers
        } else {
            DeviceType::Unknown
        }
    }
}

/// Estimated output latency in milliseconds per device type.
#[derive(Debug, Clone)]
pub struct LatencyTable {
    latencies: HashMap<DeviceType, u32>,
}

impl Default for LatencyTable {
    fn default() -> Self {
        let latencies = HashMap::from([
            (DeviceType::Bluetooth, 150),
            (DeviceType::Monitor, 8),
            (DeviceType::Usb, 5),
            (DeviceType::Headphones, 2),
            (DeviceType::Speakers, 2),
            (DeviceType::Digital, 5),
            (DeviceType::Unknown, 5),
        ]);
        Self { latencies }
    }
}

impl LatencyTable {
    /// Estimated latency for a device type, in milliseconds.
    pub fn estimate(&self, device_type: DeviceType) -> u32 {
        self.latencies
            .get(&device_type)
            .copied()
            .unwrap_or_else(|| self.latencies[&DeviceType::Unknown])
    }

    /// Override the latency for one device type. Used by tests and by
    /// callers carrying measured per-setup values.
    pub fn with_latency(mut self, device_type: DeviceType, latency_ms: u32) -> Self {
        self.latencies.insert(device_type, latency_ms);
        self
    }
}
