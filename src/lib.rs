// soundmux: multi-output audio routing engine.
//
// Builds a live routing topology (delay stages feeding a combined sink,
// or a null sink when nothing is enabled) out of a PulseAudio-compatible
// server's own modules, keeps simultaneous outputs phase-aligned by
// compensating per-device latency, and keeps its device catalog in sync
// with the server's event stream without command/event feedback loops.

pub mod catalog;
pub mod coordinator;
pub mod delay;
pub mod engine;
pub mod error;
pub mod latency;
pub mod monitor;
pub mod server;
pub mod topology;

pub use catalog::{AudioDevice, DeviceCatalog};
pub use coordinator::{ErrorKind, Notification, ValueField};
pub use delay::{build_delay_plan, DelayPlan};
pub use engine::{Engine, EngineConfig};
pub use error::{EngineError, ServerError};
pub use latency::{DeviceType, LatencyTable};
pub use server::{AudioServer, PactlServer, ServerEvent, ServerObjectId, SinkInfo};
pub use topology::{TopologyShape, TopologySnapshot, COMBINED_SINK_NAME, NULL_SINK_NAME, TOPOLOGY_PREFIX};

/// Initialize operational logging.
///
/// `verbose` raises the crate's log granularity to debug (module
/// creation/destruction, computed delays, event translation) without
/// changing behavior. `RUST_LOG` still wins when set.
pub fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "soundmux=debug"
    } else {
        "soundmux=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
