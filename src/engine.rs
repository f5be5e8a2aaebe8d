// Public engine facade.
//
// External collaborators (GUI, CLI, settings store) talk to the engine
// through this type: queries and intents go over the serialized command
// path, change notifications come back on a broadcast channel. The
// engine owns the coordinator task and the background event monitor and
// guarantees teardown of every owned routing object on shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::catalog::{AudioDevice, DeviceCatalog};
use crate::coordinator::{Command, Coordinator, Notification, Reply};
use crate::error::EngineError;
use crate::latency::LatencyTable;
use crate::monitor::EventMonitor;
use crate::server::AudioServer;
use crate::topology::{TopologyManager, TOPOLOGY_PREFIX};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Startup configuration. Persisted collaborator settings (the
/// sync-compensation default) are read by the caller and passed in here.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Initial state of latency sync compensation.
    pub sync_enabled: bool,
    /// Per-device-type latency estimates.
    pub latency_table: LatencyTable,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_enabled: true,
            latency_table: LatencyTable::default(),
        }
    }
}

/// Handle to a running routing engine.
pub struct Engine {
    cmd_tx: mpsc::Sender<Command>,
    notify_tx: broadcast::Sender<Notification>,
    monitor: Mutex<EventMonitor>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
    shutdown_started: AtomicBool,
}

impl Engine {
    /// Start the engine against an audio server.
    ///
    /// Seeds the catalog from a full sink listing (the current default
    /// sink starts enabled), sweeps stale objects left behind by a
    /// crashed prior run, builds the initial topology and spawns the
    /// coordinator and event monitor.
    pub async fn start(server: Arc<dyn AudioServer>, config: EngineConfig) -> Result<Self> {
        info!("🔊 Starting soundmux engine (sync compensation: {})", config.sync_enabled);

        let mut catalog = DeviceCatalog::new(config.latency_table);
        let sinks = server
            .list_sinks()
            .await
            .context("initial device listing failed")?;
        for sink in sinks {
            if !sink.name.starts_with(TOPOLOGY_PREFIX) {
                catalog.upsert(sink);
            }
        }

        match server.default_sink().await {
            Ok(Some(default)) if !default.starts_with(TOPOLOGY_PREFIX) => {
                if catalog.set_enabled(&default, true) {
                    info!("Default output {} starts enabled", default);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Could not determine default sink: {}", e),
        }

        let topology = TopologyManager::new(server.clone());
        match topology.sweep_stale().await {
            Ok(0) => {}
            Ok(swept) => info!("Swept {} stale object(s) from a prior run", swept),
            Err(e) => warn!("Stale object sweep failed: {}", e),
        }

        let (notify_tx, _) = broadcast::channel(64);
        let mut coordinator = Coordinator::new(
            server.clone(),
            catalog,
            topology,
            config.sync_enabled,
            notify_tx.clone(),
        );
        coordinator.bootstrap().await;

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let coordinator_handle = tokio::spawn(coordinator.run(cmd_rx));
        let monitor = EventMonitor::spawn(server, cmd_tx.clone()).await;

        Ok(Self {
            cmd_tx,
            notify_tx,
            monitor: Mutex::new(monitor),
            coordinator: Mutex::new(Some(coordinator_handle)),
            shutdown_started: AtomicBool::new(false),
        })
    }

    /// Current device list with derived display attributes, ordered by
    /// name.
    pub async fn devices(&self) -> Result<Vec<AudioDevice>, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Devices { reply: tx })
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown)
    }

    /// Add or remove a device from the active routing set.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), EngineError> {
        let name = name.to_string();
        self.request(|reply| Command::SetEnabled { name, enabled, reply })
            .await
    }

    /// Set a device's volume (0.0..=1.0).
    pub async fn set_volume(&self, name: &str, volume: f32) -> Result<(), EngineError> {
        if !volume.is_finite() || !(0.0..=1.0).contains(&volume) {
            return Err(EngineError::InvalidIntent(format!(
                "volume {volume} outside 0.0..=1.0"
            )));
        }
        let name = name.to_string();
        self.request(|reply| Command::SetVolume { name, volume, reply })
            .await
    }

    /// Mute or unmute a device.
    pub async fn set_mute(&self, name: &str, muted: bool) -> Result<(), EngineError> {
        let name = name.to_string();
        self.request(|reply| Command::SetMute { name, muted, reply })
            .await
    }

    /// Toggle latency sync compensation; rebuilds the topology when the
    /// resulting delay plan differs.
    pub async fn set_sync_compensation(&self, enabled: bool) -> Result<(), EngineError> {
        self.request(|reply| Command::SetSyncCompensation { enabled, reply })
            .await
    }

    /// Force a full re-list from the server (manual recovery).
    pub async fn refresh(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::Refresh { reply }).await
    }

    /// Subscribe to change notifications. Notifications are batched in a
    /// short debounce window; a slow subscriber may observe lag.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notify_tx.subscribe()
    }

    /// Stop the monitor and tear down every owned routing object.
    ///
    /// Idempotent: calling it twice, or after nothing was ever created,
    /// is a no-op. Teardown is best-effort and never fails the caller.
    pub async fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("🛑 Shutting down soundmux engine");

        self.monitor.lock().await.stop().await;

        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown { reply: tx }).await.is_ok() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, rx).await.is_err() {
                warn!("Coordinator did not confirm shutdown within {:?}", SHUTDOWN_TIMEOUT);
            }
        }

        if let Some(handle) = self.coordinator.lock().await.take() {
            let _ = handle.await;
        }
        info!("✅ Engine shutdown complete");
    }

    async fn request(
        &self,
        make: impl FnOnce(Reply) -> Command,
    ) -> Result<(), EngineError> {
        if self.shutdown_started.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown)?
    }
}
