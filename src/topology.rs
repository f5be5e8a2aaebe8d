// Routing topology lifecycle management.
//
// Owns every server-side object the engine creates and guarantees the
// set on the server always matches one of two shapes: a lone null sink
// (silence) or N delay stages feeding one combined sink. A reconcile
// that changes anything is a full teardown + bottom-up recreate; a
// creation failure rolls back the objects from the failing pass so the
// server is never left with a half-built topology.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::AudioDevice;
use crate::delay::DelayPlan;
use crate::error::{EngineError, ServerError};
use crate::server::{AudioServer, ServerObjectId};

/// Reserved prefix carried by every object this engine creates, so
/// ownership is unambiguous and external objects are never touched.
pub const TOPOLOGY_PREFIX: &str = "soundmux";

pub const COMBINED_SINK_NAME: &str = "soundmux_combined";
pub const NULL_SINK_NAME: &str = "soundmux_null";

/// The two mutually exclusive live shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyShape {
    Silent,
    Active,
}

/// What the topology looks like after a reconcile, for notifications.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopologySnapshot {
    pub shape: TopologyShape,
    pub members: Vec<String>,
    pub plan: DelayPlan,
}

#[derive(Debug, Clone, PartialEq)]
enum TopologyState {
    Uninitialized,
    Silent,
    Active { members: Vec<String>, plan: DelayPlan },
    TornDown,
}

#[derive(Debug)]
struct OwnedObject {
    name: String,
    id: ServerObjectId,
}

/// Owns the lifecycle of the engine's server-side routing objects.
pub struct TopologyManager {
    server: Arc<dyn AudioServer>,
    state: TopologyState,
    /// Creation order; teardown walks it in reverse so dependents go
    /// before their dependencies.
    owned: Vec<OwnedObject>,
}

impl TopologyManager {
    pub fn new(server: Arc<dyn AudioServer>) -> Self {
        Self {
            server,
            state: TopologyState::Uninitialized,
            owned: Vec::new(),
        }
    }

    /// Unload leftover prefixed modules from a crashed prior run.
    pub async fn sweep_stale(&self) -> Result<usize> {
        let stale = self
            .server
            .find_objects_with_prefix(TOPOLOGY_PREFIX)
            .await?;
        if stale.is_empty() {
            return Ok(0);
        }

        info!("🧹 Sweeping {} stale routing object(s)", stale.len());
        let mut swept = 0;
        for id in &stale {
            match self.server.destroy_object(id).await {
                Ok(()) | Err(ServerError::NotFound) => swept += 1,
                Err(e) => warn!("Failed to sweep stale object {:?}: {}", id, e),
            }
        }
        Ok(swept)
    }

    /// Bring the server-side topology in line with the enabled set.
    ///
    /// Returns `Ok(None)` when the current topology already matches
    /// (same membership and delays), `Ok(Some(snapshot))` after a
    /// rebuild.
    pub async fn reconcile(
        &mut self,
        enabled: &[AudioDevice],
        plan: &DelayPlan,
    ) -> Result<Option<TopologySnapshot>, EngineError> {
        if self.state == TopologyState::TornDown {
            return Err(EngineError::ShuttingDown);
        }

        let members: Vec<String> = enabled.iter().map(|d| d.name.clone()).collect();
        let desired = if members.is_empty() {
            TopologyState::Silent
        } else {
            TopologyState::Active {
                members: members.clone(),
                plan: plan.clone(),
            }
        };

        if desired == self.state {
            debug!("Topology already matches desired shape, skipping rebuild");
            return Ok(None);
        }

        self.teardown_owned().await;

        let result = if members.is_empty() {
            self.build_silent().await
        } else {
            self.build_active(enabled, plan).await
        };

        match result {
            Ok(()) => {
                let shape = if members.is_empty() {
                    TopologyShape::Silent
                } else {
                    TopologyShape::Active
                };
                self.state = desired;
                info!(
                    "🔀 Routing topology rebuilt: {:?} with {} member(s)",
                    shape,
                    members.len()
                );
                Ok(Some(TopologySnapshot {
                    shape,
                    members,
                    plan: plan.clone(),
                }))
            }
            Err(e) => {
                // Roll back whatever this pass managed to create.
                warn!("Topology build failed, rolling back: {}", e);
                self.teardown_owned().await;
                self.state = TopologyState::Uninitialized;
                Err(EngineError::CommandFailed(e.to_string()))
            }
        }
    }

    async fn build_silent(&mut self) -> Result<(), ServerError> {
        let id = self
            .server
            .create_null_sink(NULL_SINK_NAME, "Sound Multiplexer (silence)")
            .await?;
        self.owned.push(OwnedObject {
            name: NULL_SINK_NAME.to_string(),
            id,
        });

        if let Err(e) = self.server.set_default_sink(NULL_SINK_NAME).await {
            warn!("Failed to set {} as default sink: {}", NULL_SINK_NAME, e);
        }
        Ok(())
    }

    async fn build_active(
        &mut self,
        enabled: &[AudioDevice],
        plan: &DelayPlan,
    ) -> Result<(), ServerError> {
        // Bottom-up: stages first, combined sink last.
        let mut slaves = Vec::with_capacity(enabled.len());
        for device in enabled {
            let delay = plan.delay_for(&device.name);
            let stage_name = delay_stage_name(&device.name, delay);
            let id = self
                .server
                .create_delay_stage(&stage_name, &device.name, delay)
                .await?;
            self.owned.push(OwnedObject {
                name: stage_name.clone(),
                id,
            });
            slaves.push(stage_name);
        }

        let description = combined_description(enabled);
        let id = self
            .server
            .create_combined_sink(COMBINED_SINK_NAME, &slaves, &description)
            .await?;
        self.owned.push(OwnedObject {
            name: COMBINED_SINK_NAME.to_string(),
            id,
        });

        if let Err(e) = self.server.set_default_sink(COMBINED_SINK_NAME).await {
            warn!("Failed to set {} as default sink: {}", COMBINED_SINK_NAME, e);
        }
        Ok(())
    }

    /// Destroy every owned object, dependents first. Best-effort:
    /// individual failures are logged and never block the teardown.
    async fn teardown_owned(&mut self) {
        while let Some(object) = self.owned.pop() {
            match self.server.destroy_object(&object.id).await {
                Ok(()) => debug!("Destroyed {}", object.name),
                Err(ServerError::NotFound) => {
                    // End state is correct; nothing to surface.
                    debug!("{} was already gone", object.name);
                }
                Err(e) => warn!("Failed to destroy {}: {}", object.name, e),
            }
        }
    }

    /// Forget the cached shape so the next reconcile rebuilds even when
    /// the desired shape matches. Used on the manual recovery path: a
    /// restarted server has dropped the owned modules while the
    /// in-memory state still claims they exist.
    pub fn invalidate(&mut self) {
        if self.state != TopologyState::TornDown {
            self.state = TopologyState::Uninitialized;
        }
    }

    /// Final teardown. Idempotent: calling it twice, or with nothing
    /// ever created, is a no-op. No reconcile is accepted afterwards.
    pub async fn teardown_all(&mut self) {
        if self.state == TopologyState::TornDown {
            return;
        }
        info!("🛑 Tearing down routing topology ({} object(s))", self.owned.len());
        self.teardown_owned().await;
        self.state = TopologyState::TornDown;
    }

    #[cfg(test)]
    fn owned_names(&self) -> Vec<&str> {
        self.owned.iter().map(|o| o.name.as_str()).collect()
    }
}

/// Deterministic delay stage name: prefix + device identity + delay, so
/// stale objects from a crashed run are identifiable.
pub fn delay_stage_name(device_name: &str, delay_ms: u32) -> String {
    let sanitized: String = device_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{TOPOLOGY_PREFIX}_delay_{sanitized}_{delay_ms}ms")
}

fn combined_description(enabled: &[AudioDevice]) -> String {
    if let [only] = enabled {
        format!("Sound Multiplexer ({})", only.description)
    } else {
        format!("Sound Multiplexer ({} devices)", enabled.len())
    }
}
