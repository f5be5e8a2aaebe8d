// Synchronization coordinator: the serialized command path.
//
// Everything that mutates the catalog, reconciles the topology or
// issues command-path server calls runs here, strictly in arrival
// order. Two sources feed the channel: collaborator intents (with a
// oneshot reply) and events translated by the background monitor.
//
// Loop prevention: a volume/mute command we issue comes back from the
// server as an event. Instead of a global "updating from system" flag,
// the coordinator keeps a per-device last-set table; an incoming event
// matching the recorded value inside the validity window is already
// applied and gets dropped. Outbound notifications are debounced so an
// event burst (server restart) does not storm the collaborator;
// inbound processing is never coalesced.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::catalog::{AudioDevice, DeviceCatalog, UpsertOutcome, VOLUME_EPSILON};
use crate::delay::{build_delay_plan, DelayPlan};
use crate::error::EngineError;
use crate::server::{AudioServer, ServerEvent, SinkInfo};
use crate::topology::{TopologyManager, TopologyShape, TOPOLOGY_PREFIX};

/// Outbound notifications are batched within this window.
pub const NOTIFY_DEBOUNCE: Duration = Duration::from_millis(100);

/// How long a recorded last-set value suppresses its echoed event.
pub const SUPPRESS_WINDOW: Duration = Duration::from_millis(750);

pub type Reply = oneshot::Sender<Result<(), EngineError>>;

/// Commands processed on the serialized path, in arrival order.
#[derive(Debug)]
pub enum Command {
    SetEnabled { name: String, enabled: bool, reply: Reply },
    SetVolume { name: String, volume: f32, reply: Reply },
    SetMute { name: String, muted: bool, reply: Reply },
    SetSyncCompensation { enabled: bool, reply: Reply },
    Refresh { reply: Reply },
    Devices { reply: oneshot::Sender<Vec<AudioDevice>> },
    Server(ServerEvent),
    MonitorFailed { message: String },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Which per-device value a `DeviceValueChanged` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueField {
    Volume,
    Mute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ServerUnavailable,
    CommandFailed,
}

/// Push notifications to external collaborators.
///
/// Tagged `type`, not `kind`: `ErrorOccurred` carries its own `kind`
/// field and serde forbids a variant field shadowing the tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    DeviceListChanged,
    DeviceValueChanged {
        name: String,
        field: ValueField,
    },
    TopologyRebuilt {
        shape: TopologyShape,
        members: Vec<String>,
        plan: DelayPlan,
    },
    ErrorOccurred {
        kind: ErrorKind,
        message: String,
    },
}

#[derive(Debug, Default)]
struct LastSet {
    volume: Option<(f32, Instant)>,
    muted: Option<(bool, Instant)>,
}

/// The reconciliation authority. Sole writer of the catalog, sole
/// issuer of command-path server calls.
pub struct Coordinator {
    server: Arc<dyn AudioServer>,
    catalog: DeviceCatalog,
    topology: TopologyManager,
    sync_enabled: bool,
    last_set: HashMap<String, LastSet>,
    notify_tx: broadcast::Sender<Notification>,
    pending: Vec<Notification>,
    flush_at: Option<tokio::time::Instant>,
}

impl Coordinator {
    pub fn new(
        server: Arc<dyn AudioServer>,
        catalog: DeviceCatalog,
        topology: TopologyManager,
        sync_enabled: bool,
        notify_tx: broadcast::Sender<Notification>,
    ) -> Self {
        Self {
            server,
            catalog,
            topology,
            sync_enabled,
            last_set: HashMap::new(),
            notify_tx,
            pending: Vec::new(),
            flush_at: None,
        }
    }

    /// Initial reconcile so the live topology matches the seeded catalog
    /// before the command loop starts.
    pub async fn bootstrap(&mut self) {
        self.reconcile_topology().await;
    }

    /// Drive the serialized command path until shutdown.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        info!("⚙️ Synchronization coordinator started");
        loop {
            let deadline = self.flush_at;
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else {
                        // All senders gone: treat as shutdown.
                        self.topology.teardown_all().await;
                        break;
                    };
                    if self.handle_command(cmd).await.is_break() {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)),
                    if deadline.is_some() =>
                {
                    self.flush_notifications();
                }
            }
        }
        info!("⚙️ Synchronization coordinator stopped");
    }

    async fn handle_command(&mut self, cmd: Command) -> ControlFlow<()> {
        match cmd {
            Command::SetEnabled { name, enabled, reply } => {
                let result = self.intent_set_enabled(&name, enabled).await;
                let _ = reply.send(result);
            }
            Command::SetVolume { name, volume, reply } => {
                let result = self.intent_set_volume(&name, volume).await;
                let _ = reply.send(result);
            }
            Command::SetMute { name, muted, reply } => {
                let result = self.intent_set_mute(&name, muted).await;
                let _ = reply.send(result);
            }
            Command::SetSyncCompensation { enabled, reply } => {
                if self.sync_enabled != enabled {
                    info!("Sync compensation {}", if enabled { "enabled" } else { "disabled" });
                    self.sync_enabled = enabled;
                    self.reconcile_topology().await;
                }
                let _ = reply.send(Ok(()));
            }
            Command::Refresh { reply } => {
                let result = self.refresh_from_server().await;
                let _ = reply.send(result);
            }
            Command::Devices { reply } => {
                let _ = reply.send(self.catalog.list());
            }
            Command::Server(event) => {
                self.handle_server_event(event).await;
            }
            Command::MonitorFailed { message } => {
                warn!("Event monitor failed: {}", message);
                self.catalog.mark_stale();
                self.queue(Notification::ErrorOccurred {
                    kind: ErrorKind::ServerUnavailable,
                    message,
                });
            }
            Command::Shutdown { reply } => {
                self.topology.teardown_all().await;
                self.flush_notifications();
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn intent_set_enabled(&mut self, name: &str, enabled: bool) -> Result<(), EngineError> {
        if !self.catalog.contains(name) {
            return Err(EngineError::InvalidIntent(format!("unknown device: {name}")));
        }
        if self.catalog.set_enabled(name, enabled) {
            info!("Device {} {}", name, if enabled { "enabled" } else { "disabled" });
            self.queue(Notification::DeviceListChanged);
            self.reconcile_topology().await;
        }
        Ok(())
    }

    async fn intent_set_volume(&mut self, name: &str, volume: f32) -> Result<(), EngineError> {
        if !self.catalog.contains(name) {
            return Err(EngineError::InvalidIntent(format!("unknown device: {name}")));
        }
        if self.catalog.set_volume(name, volume) {
            if self.is_member(name) {
                self.last_set.entry(name.to_string()).or_default().volume =
                    Some((volume, Instant::now()));
                if let Err(e) = self.server.set_sink_volume(name, volume).await {
                    warn!("Failed to set volume on {}: {}", name, e);
                    self.queue(Notification::ErrorOccurred {
                        kind: ErrorKind::CommandFailed,
                        message: e.to_string(),
                    });
                }
            }
            self.queue(Notification::DeviceValueChanged {
                name: name.to_string(),
                field: ValueField::Volume,
            });
        }
        Ok(())
    }

    async fn intent_set_mute(&mut self, name: &str, muted: bool) -> Result<(), EngineError> {
        if !self.catalog.contains(name) {
            return Err(EngineError::InvalidIntent(format!("unknown device: {name}")));
        }
        if self.catalog.set_mute(name, muted) {
            if self.is_member(name) {
                self.last_set.entry(name.to_string()).or_default().muted =
                    Some((muted, Instant::now()));
                if let Err(e) = self.server.set_sink_mute(name, muted).await {
                    warn!("Failed to set mute on {}: {}", name, e);
                    self.queue(Notification::ErrorOccurred {
                        kind: ErrorKind::CommandFailed,
                        message: e.to_string(),
                    });
                }
            }
            self.queue(Notification::DeviceValueChanged {
                name: name.to_string(),
                field: ValueField::Mute,
            });
        }
        Ok(())
    }

    async fn refresh_from_server(&mut self) -> Result<(), EngineError> {
        let sinks = match self.server.list_sinks().await {
            Ok(sinks) => sinks,
            Err(e) => {
                self.catalog.mark_stale();
                self.queue(Notification::ErrorOccurred {
                    kind: ErrorKind::ServerUnavailable,
                    message: e.to_string(),
                });
                return Err(e.into());
            }
        };

        let sinks: Vec<SinkInfo> = sinks
            .into_iter()
            .filter(|s| !s.name.starts_with(TOPOLOGY_PREFIX))
            .collect();

        let (visible, _membership) = self.catalog.sync_full(sinks);
        self.catalog.clear_stale();
        if visible {
            self.queue(Notification::DeviceListChanged);
        }
        // Manual recovery: a restarted server has dropped our modules
        // even though the in-memory shape may still match, so the
        // matching-shape shortcut must not apply here.
        self.topology.invalidate();
        self.reconcile_topology().await;
        Ok(())
    }

    async fn handle_server_event(&mut self, event: ServerEvent) {
        if event_device_name(&event).starts_with(TOPOLOGY_PREFIX) {
            debug!("Ignoring event for owned object: {:?}", event);
            return;
        }

        match event {
            ServerEvent::Discovered { sink } => match self.catalog.upsert(sink) {
                UpsertOutcome::Inserted { enabled } => {
                    self.queue(Notification::DeviceListChanged);
                    if enabled {
                        self.reconcile_topology().await;
                    }
                }
                UpsertOutcome::Updated => {
                    self.queue(Notification::DeviceListChanged);
                }
                UpsertOutcome::Unchanged => {}
            },
            ServerEvent::Removed { name } => {
                if let Some(removed) = self.catalog.remove(&name) {
                    self.last_set.remove(&name);
                    self.queue(Notification::DeviceListChanged);
                    if removed.was_enabled {
                        self.reconcile_topology().await;
                    }
                }
            }
            ServerEvent::VolumeChanged { name, volume } => {
                if self.consume_suppressed_volume(&name, volume) {
                    debug!("Suppressed echoed volume event for {}", name);
                    return;
                }
                if self.catalog.set_volume(&name, volume) {
                    self.queue(Notification::DeviceValueChanged {
                        name,
                        field: ValueField::Volume,
                    });
                }
            }
            ServerEvent::MuteChanged { name, muted } => {
                if self.consume_suppressed_mute(&name, muted) {
                    debug!("Suppressed echoed mute event for {}", name);
                    return;
                }
                if self.catalog.set_mute(&name, muted) {
                    self.queue(Notification::DeviceValueChanged {
                        name,
                        field: ValueField::Mute,
                    });
                }
            }
            ServerEvent::DescriptionChanged { name, description } => {
                if self.catalog.set_description(&name, &description) {
                    self.queue(Notification::DeviceListChanged);
                    // A metadata change can reclassify the device and move
                    // its latency estimate, which shifts the delay plan.
                    if self.is_member(&name) {
                        self.reconcile_topology().await;
                    }
                }
            }
        }
    }

    /// Echo of a value we set ourselves? Consumes the record on a hit.
    fn consume_suppressed_volume(&mut self, name: &str, volume: f32) -> bool {
        let Some(entry) = self.last_set.get_mut(name) else {
            return false;
        };
        match entry.volume {
            Some((set, at))
                if at.elapsed() <= SUPPRESS_WINDOW && (set - volume).abs() <= VOLUME_EPSILON =>
            {
                entry.volume = None;
                true
            }
            _ => false,
        }
    }

    fn consume_suppressed_mute(&mut self, name: &str, muted: bool) -> bool {
        let Some(entry) = self.last_set.get_mut(name) else {
            return false;
        };
        match entry.muted {
            Some((set, at)) if at.elapsed() <= SUPPRESS_WINDOW && set == muted => {
                entry.muted = None;
                true
            }
            _ => false,
        }
    }

    fn is_member(&self, name: &str) -> bool {
        self.catalog.get(name).map(|d| d.enabled).unwrap_or(false)
    }

    /// Recompute the delay plan and reconcile the topology against the
    /// current enabled set.
    async fn reconcile_topology(&mut self) {
        let enabled = self.catalog.enabled_devices();
        let plan = build_delay_plan(
            enabled.iter().map(|d| (d.name.as_str(), d.latency_ms)),
            self.sync_enabled,
        );

        match self.topology.reconcile(&enabled, &plan).await {
            Ok(Some(snapshot)) => {
                self.queue(Notification::TopologyRebuilt {
                    shape: snapshot.shape,
                    members: snapshot.members,
                    plan: snapshot.plan,
                });
            }
            Ok(None) => {}
            Err(EngineError::ShuttingDown) => {}
            Err(e) => {
                warn!("Topology reconcile failed: {}", e);
                self.queue(Notification::ErrorOccurred {
                    kind: ErrorKind::CommandFailed,
                    message: e.to_string(),
                });
            }
        }
    }

    /// Queue a notification for the next debounce flush. Duplicates
    /// within one batch are collapsed.
    fn queue(&mut self, notification: Notification) {
        if !self.pending.contains(&notification) {
            self.pending.push(notification);
        }
        if self.flush_at.is_none() {
            self.flush_at = Some(tokio::time::Instant::now() + NOTIFY_DEBOUNCE);
        }
    }

    fn flush_notifications(&mut self) {
        self.flush_at = None;
        for notification in self.pending.drain(..) {
            // Send errors just mean nobody is subscribed right now.
            let _ = self.notify_tx.send(notification);
        }
    }
}

fn event_device_name(event: &ServerEvent) -> &str {
    match event {
        ServerEvent::Discovered { sink } => &sink.name,
        ServerEvent::Removed { name }
        | ServerEvent::VolumeChanged { name, .. }
        | ServerEvent::MuteChanged { name, .. }
        | ServerEvent::DescriptionChanged { name, .. } => name,
    }
}
