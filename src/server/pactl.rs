// PulseAudio backend driving the `pactl` CLI.
//
// Every command is one bounded-timeout `pactl` invocation. Event
// subscription wraps `pactl subscribe`: the raw stream only says that
// *something* changed on a sink, so the subscription task re-lists sinks
// on each event and diffs against its own snapshot to produce concrete
// volume/mute/description/lifecycle events.
//
// PulseAudio has no dedicated delay module, so a delay stage is realized
// as a prefixed null sink plus a `module-loopback` into the real device
// with `latency_msec` set to the compensation delay.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{ServerEvent, ServerObjectId, SinkInfo};
use crate::error::ServerError;

/// PulseAudio's PA_VOLUME_NORM: 100% volume in raw channel units.
const VOLUME_NORM: f32 = 65536.0;

/// Sink volumes closer than this are considered equal; the server's
/// integer volume representation rounds percentages.
const VOLUME_EPSILON: f32 = 0.01;

/// `module-loopback` interprets `latency_msec=0` as "use the default";
/// the smallest real value is 1.
const MIN_LOOPBACK_LATENCY_MS: u32 = 1;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Audio server backend shelling out to `pactl`.
#[derive(Debug, Clone)]
pub struct PactlServer {
    binary: String,
    timeout: Duration,
}

impl Default for PactlServer {
    fn default() -> Self {
        Self::new()
    }
}

impl PactlServer {
    pub fn new() -> Self {
        Self {
            binary: "pactl".to_string(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Use a different binary (e.g. an absolute path) or timeout.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run one pactl invocation and return its stdout.
    async fn run(&self, args: &[&str]) -> Result<String, ServerError> {
        let command_line = format!("{} {}", self.binary, args.join(" "));
        debug!("Running server command: {}", command_line);

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary)
                .args(args)
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| ServerError::Timeout {
            command: command_line.clone(),
            timeout_ms: self.timeout.as_millis() as u64,
        })?
        .map_err(|e| ServerError::Unavailable(format!("failed to run {}: {}", self.binary, e)))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("No such entity") || stderr.contains("Entity does not exist") {
            return Err(ServerError::NotFound);
        }
        Err(ServerError::CommandFailed {
            command: command_line,
            message: stderr,
        })
    }

    async fn load_module(&self, args: &[&str]) -> Result<u32, ServerError> {
        let stdout = self.run(args).await?;
        stdout
            .trim()
            .parse::<u32>()
            .map_err(|_| ServerError::Parse(format!("unexpected load-module output: {stdout:?}")))
    }

    async fn unload_module(&self, module: u32) -> Result<(), ServerError> {
        let module_arg = module.to_string();
        self.run(&["unload-module", &module_arg]).await.map(|_| ())
    }
}

#[derive(Debug, Deserialize)]
struct JsonSink {
    index: u32,
    name: String,
    description: String,
    mute: bool,
    #[serde(default)]
    volume: HashMap<String, JsonChannelVolume>,
}

#[derive(Debug, Deserialize)]
struct JsonChannelVolume {
    value: u32,
}

impl JsonSink {
    fn into_sink_info(self) -> SinkInfo {
        let volume = if self.volume.is_empty() {
            1.0
        } else {
            let sum: f32 = self.volume.values().map(|v| v.value as f32).sum();
            sum / (self.volume.len() as f32 * VOLUME_NORM)
        };
        SinkInfo {
            index: self.index,
            name: self.name,
            description: self.description,
            volume,
            muted: self.mute,
        }
    }
}

/// Strip characters that would break pactl's module-argument quoting.
fn sanitize_description(description: &str) -> String {
    description.replace(['\'', '"', '\n'], " ")
}

#[async_trait::async_trait]
impl super::AudioServer for PactlServer {
    async fn list_sinks(&self) -> Result<Vec<SinkInfo>, ServerError> {
        let stdout = self.run(&["--format=json", "list", "sinks"]).await?;
        let sinks: Vec<JsonSink> = serde_json::from_str(&stdout)
            .map_err(|e| ServerError::Parse(format!("sink list: {e}")))?;
        Ok(sinks.into_iter().map(JsonSink::into_sink_info).collect())
    }

    async fn default_sink(&self) -> Result<Option<String>, ServerError> {
        let stdout = self.run(&["get-default-sink"]).await?;
        let name = stdout.trim();
        if name.is_empty() {
            Ok(None)
        } else {
            Ok(Some(name.to_string()))
        }
    }

    async fn create_combined_sink(
        &self,
        name: &str,
        members: &[String],
        description: &str,
    ) -> Result<ServerObjectId, ServerError> {
        let sink_name = format!("sink_name={name}");
        let slaves = format!("slaves={}", members.join(","));
        let properties = format!(
            "sink_properties=device.description='{}'",
            sanitize_description(description)
        );
        let module = self
            .load_module(&[
                "load-module",
                "module-combine-sink",
                &sink_name,
                &slaves,
                &properties,
            ])
            .await?;
        info!(
            "Created combined sink {} (module {}) with {} member(s)",
            name,
            module,
            members.len()
        );
        Ok(ServerObjectId::single(module))
    }

    async fn create_delay_stage(
        &self,
        name: &str,
        master: &str,
        delay_ms: u32,
    ) -> Result<ServerObjectId, ServerError> {
        let sink_name = format!("sink_name={name}");
        let properties = format!(
            "sink_properties=device.description='Delay stage for {}'",
            sanitize_description(master)
        );
        let stage = self
            .load_module(&["load-module", "module-null-sink", &sink_name, &properties])
            .await?;

        let source = format!("source={name}.monitor");
        let sink = format!("sink={master}");
        let latency = format!(
            "latency_msec={}",
            delay_ms.max(MIN_LOOPBACK_LATENCY_MS)
        );
        let loopback = match self
            .load_module(&[
                "load-module",
                "module-loopback",
                &source,
                &sink,
                &latency,
                "source_dont_move=true",
                "sink_dont_move=true",
            ])
            .await
        {
            Ok(module) => module,
            Err(e) => {
                // Half-built stage: drop the null sink before failing.
                if let Err(cleanup_err) = self.unload_module(stage).await {
                    warn!(
                        "Failed to clean up stage sink {} after loopback failure: {}",
                        name, cleanup_err
                    );
                }
                return Err(e);
            }
        };

        info!(
            "Created delay stage {} -> {} ({}ms, modules {}/{})",
            name, master, delay_ms, stage, loopback
        );
        Ok(ServerObjectId(vec![stage, loopback]))
    }

    async fn create_null_sink(
        &self,
        name: &str,
        description: &str,
    ) -> Result<ServerObjectId, ServerError> {
        let sink_name = format!("sink_name={name}");
        let properties = format!(
            "sink_properties=device.description='{}'",
            sanitize_description(description)
        );
        let module = self
            .load_module(&["load-module", "module-null-sink", &sink_name, &properties])
            .await?;
        info!("Created null sink {} (module {})", name, module);
        Ok(ServerObjectId::single(module))
    }

    async fn destroy_object(&self, id: &ServerObjectId) -> Result<(), ServerError> {
        let mut failure = None;
        // Unload in reverse creation order: the loopback references the
        // stage sink, so it goes first.
        for &module in id.modules().iter().rev() {
            match self.unload_module(module).await {
                Ok(()) => debug!("Unloaded module {}", module),
                Err(ServerError::NotFound) => {
                    debug!("Module {} already gone", module);
                }
                Err(e) => {
                    warn!("Failed to unload module {}: {}", module, e);
                    failure = Some(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn set_sink_volume(&self, name: &str, volume: f32) -> Result<(), ServerError> {
        let percent = format!("{}%", (volume * 100.0).round() as u32);
        self.run(&["set-sink-volume", name, &percent]).await.map(|_| ())
    }

    async fn set_sink_mute(&self, name: &str, muted: bool) -> Result<(), ServerError> {
        let flag = if muted { "1" } else { "0" };
        self.run(&["set-sink-mute", name, flag]).await.map(|_| ())
    }

    async fn set_default_sink(&self, name: &str) -> Result<(), ServerError> {
        self.run(&["set-default-sink", name]).await.map(|_| ())
    }

    async fn find_objects_with_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<ServerObjectId>, ServerError> {
        let stdout = self.run(&["list", "short", "modules"]).await?;
        let sink_name_marker = format!("sink_name={prefix}");
        let source_marker = format!("source={prefix}");

        let mut objects = Vec::new();
        for line in stdout.lines() {
            // Format: "<id>\t<module name>\t<arguments>"
            let mut fields = line.split('\t');
            let (Some(id_field), Some(_), Some(args)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if !args.contains(&sink_name_marker) && !args.contains(&source_marker) {
                continue;
            }
            if let Ok(module) = id_field.trim().parse::<u32>() {
                objects.push(ServerObjectId::single(module));
            }
        }
        Ok(objects)
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<ServerEvent>, ServerError> {
        let mut child = Command::new(&self.binary)
            .arg("subscribe")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ServerError::Unavailable(format!("failed to start {} subscribe: {e}", self.binary))
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            ServerError::Unavailable("pactl subscribe produced no stdout".to_string())
        })?;

        let (tx, rx) = mpsc::channel(64);
        let server = self.clone();

        tokio::spawn(async move {
            // The baseline is empty: the first diff announces every
            // current sink, so one appearing between a caller's own
            // listing and this subscription still gets a Discovered.
            let mut snapshot: HashMap<String, SinkInfo> = HashMap::new();
            match server.list_sinks().await {
                Ok(sinks) => {
                    for event in diff_sinks(&mut snapshot, sinks) {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!("Initial sink listing failed: {}", e),
            }

            let mut lines = BufReader::new(stdout).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        warn!("pactl subscribe stream ended");
                        break;
                    }
                    Err(e) => {
                        warn!("pactl subscribe read error: {}", e);
                        break;
                    }
                };

                if !line.contains("on sink #") {
                    continue;
                }

                let sinks = match server.list_sinks().await {
                    Ok(sinks) => sinks,
                    Err(e) => {
                        warn!("Sink re-list after event failed: {}", e);
                        break;
                    }
                };

                let events = diff_sinks(&mut snapshot, sinks);
                let mut closed = false;
                for event in events {
                    if tx.send(event).await.is_err() {
                        closed = true;
                        break;
                    }
                }
                if closed {
                    debug!("Event receiver dropped, ending pactl subscription");
                    break;
                }
            }

            // Dropping the child kills the pactl subprocess.
            drop(child);
        });

        Ok(rx)
    }
}

/// Diff a fresh sink list against the snapshot, updating the snapshot
/// in place and returning the translated events.
fn diff_sinks(
    snapshot: &mut HashMap<String, SinkInfo>,
    sinks: Vec<SinkInfo>,
) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    let mut seen: Vec<String> = Vec::with_capacity(sinks.len());

    for sink in sinks {
        seen.push(sink.name.clone());
        match snapshot.get(&sink.name) {
            None => {
                events.push(ServerEvent::Discovered { sink: sink.clone() });
                snapshot.insert(sink.name.clone(), sink);
            }
            Some(known) => {
                if (known.volume - sink.volume).abs() > VOLUME_EPSILON {
                    events.push(ServerEvent::VolumeChanged {
                        name: sink.name.clone(),
                        volume: sink.volume,
                    });
                }
                if known.muted != sink.muted {
                    events.push(ServerEvent::MuteChanged {
                        name: sink.name.clone(),
                        muted: sink.muted,
                    });
                }
                if known.description != sink.description {
                    events.push(ServerEvent::DescriptionChanged {
                        name: sink.name.clone(),
                        description: sink.description.clone(),
                    });
                }
                if known.index != sink.index {
                    // Same name, new server session: re-announce so the
                    // catalog picks up the fresh index.
                    events.push(ServerEvent::Discovered { sink: sink.clone() });
                }
                snapshot.insert(sink.name.clone(), sink);
            }
        }
    }

    let gone: Vec<String> = snapshot
        .keys()
        .filter(|name| !seen.contains(name))
        .cloned()
        .collect();
    for name in gone {
        snapshot.remove(&name);
        events.push(ServerEvent::Removed { name });
    }

    events
}
