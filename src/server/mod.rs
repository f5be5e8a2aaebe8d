// Abstract audio-server capability.
//
// Any server exposing sinks, loadable routing modules and a subscribable
// event stream qualifies. The engine is written against this trait; the
// pactl backend in `pactl.rs` is the production implementation and tests
// plug in fakes/mocks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ServerError;

pub mod pactl;

pub use pactl::PactlServer;

#[cfg(test)]
use mockall::automock;

/// Sink metadata as reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkInfo {
    pub index: u32,
    pub name: String,
    pub description: String,
    /// Flat volume, 0.0..=1.0 (values above 1.0 are possible on servers
    /// that allow over-amplification and are passed through as-is).
    pub volume: f32,
    pub muted: bool,
}

/// Handle to a server-side object created by this engine.
///
/// One logical object may be backed by more than one loaded module: the
/// pactl delay stage loads a null sink plus a loopback. Destroying the
/// object unloads every backing module.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServerObjectId(pub Vec<u32>);

impl ServerObjectId {
    pub fn single(module: u32) -> Self {
        Self(vec![module])
    }

    pub fn modules(&self) -> &[u32] {
        &self.0
    }
}

/// Device lifecycle and property-change events, already translated from
/// the server's raw event categories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerEvent {
    Discovered { sink: SinkInfo },
    Removed { name: String },
    VolumeChanged { name: String, volume: f32 },
    MuteChanged { name: String, muted: bool },
    DescriptionChanged { name: String, description: String },
}

/// Capability contract consumed from the external audio server.
///
/// All calls are synchronous request/response exchanges with a bounded
/// timeout; `subscribe` hands back an independent event stream so a slow
/// command never blocks event delivery.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AudioServer: Send + Sync {
    async fn list_sinks(&self) -> Result<Vec<SinkInfo>, ServerError>;

    /// Name of the server's current default sink, if one is set.
    async fn default_sink(&self) -> Result<Option<String>, ServerError>;

    async fn create_combined_sink(
        &self,
        name: &str,
        members: &[String],
        description: &str,
    ) -> Result<ServerObjectId, ServerError>;

    /// Create a delay stage sink wrapping `master`, adding `delay_ms` of
    /// buffering in front of it.
    async fn create_delay_stage(
        &self,
        name: &str,
        master: &str,
        delay_ms: u32,
    ) -> Result<ServerObjectId, ServerError>;

    async fn create_null_sink(
        &self,
        name: &str,
        description: &str,
    ) -> Result<ServerObjectId, ServerError>;

    /// Destroy a previously created object. `Err(ServerError::NotFound)`
    /// means the object was already gone; callers treat that as success.
    async fn destroy_object(&self, id: &ServerObjectId) -> Result<(), ServerError>;

    async fn set_sink_volume(&self, name: &str, volume: f32) -> Result<(), ServerError>;

    async fn set_sink_mute(&self, name: &str, muted: bool) -> Result<(), ServerError>;

    async fn set_default_sink(&self, name: &str) -> Result<(), ServerError>;

    /// Objects whose sink name carries `prefix`. Used to sweep leftovers
    /// from a crashed prior run and to verify teardown.
    async fn find_objects_with_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<ServerObjectId>, ServerError>;

    /// Subscribe to device lifecycle and property-change events. The
    /// stream ends when the subscription is lost or the receiver is
    /// dropped.
    async fn subscribe(&self) -> Result<mpsc::Receiver<ServerEvent>, ServerError>;
}
