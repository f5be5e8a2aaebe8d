// Server event monitor.
//
// A background worker draining the server's event subscription for the
// lifetime of the engine. It holds no device state: every event is
// forwarded onto the serialized command path, which is the only writer
// of the catalog. Stopping is cooperative: a watch flag unblocks the
// pending wait and dropping the subscription receiver closes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordinator::Command;
use crate::server::AudioServer;

const STOP_WAIT: Duration = Duration::from_secs(2);

/// Long-running listener on the server's event stream.
pub struct EventMonitor {
    handle: Option<JoinHandle<()>>,
    stop_tx: watch::Sender<bool>,
    running: Arc<AtomicBool>,
}

impl EventMonitor {
    /// Subscribe and start forwarding translated events into `cmd_tx`.
    ///
    /// The subscription is taken before this returns, so events arriving
    /// right after startup cannot slip past an unregistered stream.
    pub async fn spawn(
        server: Arc<dyn AudioServer>,
        cmd_tx: mpsc::Sender<Command>,
    ) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let mut events = match server.subscribe().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Event subscription failed: {}", e);
                let _ = cmd_tx
                    .send(Command::MonitorFailed {
                        message: e.to_string(),
                    })
                    .await;
                return Self {
                    handle: None,
                    stop_tx,
                    running: Arc::new(AtomicBool::new(false)),
                };
            }
        };

        let running = Arc::new(AtomicBool::new(true));
        let running_flag = running.clone();

        let handle = tokio::spawn(async move {
            info!("🔍 Server event monitor started");

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            debug!("Event monitor stop requested");
                            break;
                        }
                    }
                    event = events.recv() => {
                        match event {
                            Some(event) => {
                                if cmd_tx.send(Command::Server(event)).await.is_err() {
                                    debug!("Command path closed, stopping event monitor");
                                    break;
                                }
                            }
                            None => {
                                // Subscription lost while we are still
                                // supposed to be running: surface once.
                                warn!("Server event stream ended unexpectedly");
                                let _ = cmd_tx
                                    .send(Command::MonitorFailed {
                                        message: "event subscription lost".to_string(),
                                    })
                                    .await;
                                break;
                            }
                        }
                    }
                }
            }

            // Dropping `events` closes the underlying subscription.
            running_flag.store(false, Ordering::SeqCst);
            info!("🛑 Server event monitor stopped");
        });

        Self {
            handle: Some(handle),
            stop_tx,
            running,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Cooperative stop with a bounded wait.
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout(STOP_WAIT, &mut handle).await.is_err() {
                warn!("Event monitor did not stop within {:?}, aborting", STOP_WAIT);
                handle.abort();
            }
        }
    }
}

impl Drop for EventMonitor {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}
