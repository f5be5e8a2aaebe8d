// Device catalog: the engine's view of the server's output devices.
//
// Devices are keyed by sink name, the only identity that survives a
// server restart; the index is kept as a transient cross-reference for
// the current session. Enabled/volume/mute state of a device that
// disappears is remembered by name and restored when a device with the
// same name comes back.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tracing::debug;

use crate::latency::{DeviceType, LatencyTable};
use crate::server::SinkInfo;

/// Volume changes smaller than this are treated as no-ops; the server
/// reports volumes quantized to integer percentages.
pub const VOLUME_EPSILON: f32 = 0.01;

/// A known audio output device and its local state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioDevice {
    /// Server-assigned index, only valid for the current server session.
    pub index: u32,
    /// Stable sink name, the durable key.
    pub name: String,
    pub description: String,
    pub device_type: DeviceType,
    /// Flat volume, 0.0..=1.0.
    pub volume: f32,
    pub muted: bool,
    /// Whether the device is part of the active routing set.
    pub enabled: bool,
    /// Estimated output latency in milliseconds, derived from the type.
    pub latency_ms: u32,
}

/// Outcome of an upsert, so callers can suppress redundant downstream
/// work and detect membership changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New entry. `enabled` is true when remembered state re-enabled a
    /// returning device.
    Inserted { enabled: bool },
    /// Existing entry, visible metadata changed.
    Updated,
    /// Nothing the collaborator can observe changed.
    Unchanged,
}

/// Reported by `remove` so the caller knows whether a topology member
/// went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovedDevice {
    pub was_enabled: bool,
}

#[derive(Debug, Clone, Copy)]
struct RetainedState {
    enabled: bool,
    volume: f32,
    muted: bool,
}

/// Name-keyed catalog of known output devices.
#[derive(Debug)]
pub struct DeviceCatalog {
    devices: BTreeMap<String, AudioDevice>,
    remembered: HashMap<String, RetainedState>,
    latency_table: LatencyTable,
    stale: bool,
}

impl DeviceCatalog {
    pub fn new(latency_table: LatencyTable) -> Self {
        Self {
            devices: BTreeMap::new(),
            remembered: HashMap::new(),
            latency_table,
            stale: false,
        }
    }

    /// Insert or merge a server-reported sink.
    ///
    /// Existing entries keep their enabled/volume/mute state; discovery
    /// only refreshes identity and metadata. A returning device restores
    /// the state remembered at its removal. The device type (and with it
    /// the latency estimate) is re-derived when the metadata changed.
    pub fn upsert(&mut self, sink: SinkInfo) -> UpsertOutcome {
        if let Some(existing) = self.devices.get_mut(&sink.name) {
            let mut visible_change = false;
            if existing.description != sink.description {
                existing.description = sink.description;
                existing.device_type =
                    DeviceType::classify(&existing.name, &existing.description);
                existing.latency_ms = self.latency_table.estimate(existing.device_type);
                visible_change = true;
            }
            existing.index = sink.index;
            if visible_change {
                UpsertOutcome::Updated
            } else {
                UpsertOutcome::Unchanged
            }
        } else {
            let device_type = DeviceType::classify(&sink.name, &sink.description);
            let latency_ms = self.latency_table.estimate(device_type);
            let retained = self.remembered.remove(&sink.name);
            let device = AudioDevice {
                index: sink.index,
                name: sink.name.clone(),
                description: sink.description,
                device_type,
                volume: retained.map(|r| r.volume).unwrap_or(sink.volume),
                muted: retained.map(|r| r.muted).unwrap_or(sink.muted),
                enabled: retained.map(|r| r.enabled).unwrap_or(false),
                latency_ms,
            };
            let enabled = device.enabled;
            debug!(
                "Discovered device {} ({:?}, {}ms, enabled={})",
                device.name, device.device_type, device.latency_ms, enabled
            );
            self.devices.insert(sink.name, device);
            UpsertOutcome::Inserted { enabled }
        }
    }

    /// Remove a device, remembering its state for a possible return.
    pub fn remove(&mut self, name: &str) -> Option<RemovedDevice> {
        let device = self.devices.remove(name)?;
        self.remembered.insert(
            device.name.clone(),
            RetainedState {
                enabled: device.enabled,
                volume: device.volume,
                muted: device.muted,
            },
        );
        debug!("Removed device {} (was_enabled={})", name, device.enabled);
        Some(RemovedDevice {
            was_enabled: device.enabled,
        })
    }

    pub fn get(&self, name: &str) -> Option<&AudioDevice> {
        self.devices.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.devices.contains_key(name)
    }

    /// All known devices, ordered by name.
    pub fn list(&self) -> Vec<AudioDevice> {
        self.devices.values().cloned().collect()
    }

    /// The enabled subset, ordered by name.
    pub fn enabled_devices(&self) -> Vec<AudioDevice> {
        self.devices.values().filter(|d| d.enabled).cloned().collect()
    }

    /// Set the enabled flag; returns whether the value actually changed.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.devices.get_mut(name) {
            Some(device) if device.enabled != enabled => {
                device.enabled = enabled;
                true
            }
            _ => false,
        }
    }

    /// Set the volume; returns whether it changed beyond the epsilon.
    pub fn set_volume(&mut self, name: &str, volume: f32) -> bool {
        match self.devices.get_mut(name) {
            Some(device) if (device.volume - volume).abs() > VOLUME_EPSILON => {
                device.volume = volume;
                true
            }
            _ => false,
        }
    }

    /// Update the description, re-deriving the device type and latency
    /// estimate; returns whether anything changed.
    pub fn set_description(&mut self, name: &str, description: &str) -> bool {
        match self.devices.get_mut(name) {
            Some(device) if device.description != description => {
                device.description = description.to_string();
                device.device_type = DeviceType::classify(&device.name, &device.description);
                device.latency_ms = self.latency_table.estimate(device.device_type);
                true
            }
            _ => false,
        }
    }

    /// Set the mute flag; returns whether the value actually changed.
    pub fn set_mute(&mut self, name: &str, muted: bool) -> bool {
        match self.devices.get_mut(name) {
            Some(device) if device.muted != muted => {
                device.muted = muted;
                true
            }
            _ => false,
        }
    }

    /// Replace the catalog contents with a full server listing.
    ///
    /// Returns (visible change, membership change).
    pub fn sync_full(&mut self, sinks: Vec<SinkInfo>) -> (bool, bool) {
        let mut visible_change = false;
        let mut membership_change = false;

        let fresh_names: Vec<String> = sinks.iter().map(|s| s.name.clone()).collect();
        for sink in sinks {
            match self.upsert(sink) {
                UpsertOutcome::Inserted { enabled } => {
                    visible_change = true;
                    membership_change |= enabled;
                }
                UpsertOutcome::Updated => visible_change = true,
                UpsertOutcome::Unchanged => {}
            }
        }

        let gone: Vec<String> = self
            .devices
            .keys()
            .filter(|name| !fresh_names.contains(name))
            .cloned()
            .collect();
        for name in gone {
            if let Some(removed) = self.remove(&name) {
                visible_change = true;
                membership_change |= removed.was_enabled;
            }
        }

        (visible_change, membership_change)
    }

    /// Last-known data may no longer match the server.
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn clear_stale(&mut self) {
        self.stale = false;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }
}
