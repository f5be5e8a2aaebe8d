// In-memory audio server for end-to-end engine tests.
//
// Tracks every loaded module in a ledger so tests can verify that the
// engine owns exactly the objects it should and that shutdown leaves
// nothing behind. Events are injected by the test, never synthesized,
// so echo scenarios are fully scripted.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use soundmux::{AudioServer, Notification, ServerError, ServerEvent, ServerObjectId, SinkInfo};

/// Collect every notification already delivered to a subscriber.
#[allow(dead_code)]
pub fn drain_notifications(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        out.push(notification);
    }
    out
}

#[derive(Default)]
struct State {
    sinks: Vec<SinkInfo>,
    default_sink: Option<String>,
    next_module: u32,
    /// module id -> object name
    loaded: BTreeMap<u32, String>,
    combined_created: u32,
    null_created: u32,
    stages_created: u32,
    volume_calls: Vec<(String, f32)>,
    mute_calls: Vec<(String, bool)>,
    fail_next_create: bool,
}

pub struct FakeServer {
    state: Mutex<State>,
    event_tx: Mutex<Option<mpsc::Sender<ServerEvent>>>,
}

#[allow(dead_code)]
impl FakeServer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_module: 1,
                ..State::default()
            }),
            event_tx: Mutex::new(None),
        }
    }

    pub fn sink(index: u32, name: &str, description: &str) -> SinkInfo {
        SinkInfo {
            index,
            name: name.to_string(),
            description: description.to_string(),
            volume: 1.0,
            muted: false,
        }
    }

    pub fn add_sink(&self, index: u32, name: &str, description: &str) {
        self.state
            .lock()
            .unwrap()
            .sinks
            .push(Self::sink(index, name, description));
    }

    pub fn set_default(&self, name: &str) {
        self.state.lock().unwrap().default_sink = Some(name.to_string());
    }

    /// Pretend a module from a crashed prior run is still loaded.
    pub fn preload_module(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        let id = state.next_module;
        state.next_module += 1;
        state.loaded.insert(id, name.to_string());
    }

    /// Simulate a server restart dropping every loaded module.
    pub fn clear_modules(&self) {
        self.state.lock().unwrap().loaded.clear();
    }

    /// Make the next create_* call fail.
    pub fn fail_next_create(&self) {
        self.state.lock().unwrap().fail_next_create = true;
    }

    pub async fn push_event(&self, event: ServerEvent) {
        let tx = self
            .event_tx
            .lock()
            .unwrap()
            .clone()
            .expect("no active subscription");
        tx.send(event).await.expect("event receiver dropped");
    }

    pub fn owned_object_count(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .loaded
            .values()
            .filter(|name| name.starts_with(prefix))
            .count()
    }

    pub fn loaded_object_names(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state.loaded.values().cloned().collect();
        names.dedup();
        names
    }

    pub fn combined_created(&self) -> u32 {
        self.state.lock().unwrap().combined_created
    }

    pub fn null_created(&self) -> u32 {
        self.state.lock().unwrap().null_created
    }

    pub fn stages_created(&self) -> u32 {
        self.state.lock().unwrap().stages_created
    }

    pub fn volume_calls(&self) -> Vec<(String, f32)> {
        self.state.lock().unwrap().volume_calls.clone()
    }

    pub fn mute_calls(&self) -> Vec<(String, bool)> {
        self.state.lock().unwrap().mute_calls.clone()
    }

    fn create_object(&self, name: &str, modules: usize) -> Result<ServerObjectId, ServerError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_next_create {
            state.fail_next_create = false;
            return Err(ServerError::CommandFailed {
                command: format!("create {name}"),
                message: "scripted failure".to_string(),
            });
        }
        let mut ids = Vec::with_capacity(modules);
        for _ in 0..modules {
            let id = state.next_module;
            state.next_module += 1;
            state.loaded.insert(id, name.to_string());
            ids.push(id);
        }
        Ok(ServerObjectId(ids))
    }
}

#[async_trait]
impl AudioServer for FakeServer {
    async fn list_sinks(&self) -> Result<Vec<SinkInfo>, ServerError> {
        Ok(self.state.lock().unwrap().sinks.clone())
    }

    async fn default_sink(&self) -> Result<Option<String>, ServerError> {
        Ok(self.state.lock().unwrap().default_sink.clone())
    }

    async fn create_combined_sink(
        &self,
        name: &str,
        _members: &[String],
        _description: &str,
    ) -> Result<ServerObjectId, ServerError> {
        let id = self.create_object(name, 1)?;
        self.state.lock().unwrap().combined_created += 1;
        Ok(id)
    }

    async fn create_delay_stage(
        &self,
        name: &str,
        _master: &str,
        _delay_ms: u32,
    ) -> Result<ServerObjectId, ServerError> {
        // Two backing modules, like the pactl null-sink + loopback pair.
        let id = self.create_object(name, 2)?;
        self.state.lock().unwrap().stages_created += 1;
        Ok(id)
    }

    async fn create_null_sink(
        &self,
        name: &str,
        _description: &str,
    ) -> Result<ServerObjectId, ServerError> {
        let id = self.create_object(name, 1)?;
        self.state.lock().unwrap().null_created += 1;
        Ok(id)
    }

    async fn destroy_object(&self, id: &ServerObjectId) -> Result<(), ServerError> {
        let mut state = self.state.lock().unwrap();
        for module in id.modules() {
            // Already-gone modules are fine: not-found is success.
            state.loaded.remove(module);
        }
        Ok(())
    }

    async fn set_sink_volume(&self, name: &str, volume: f32) -> Result<(), ServerError> {
        let mut state = self.state.lock().unwrap();
        state.volume_calls.push((name.to_string(), volume));
        if let Some(sink) = state.sinks.iter_mut().find(|s| s.name == name) {
            sink.volume = volume;
        }
        Ok(())
    }

    async fn set_sink_mute(&self, name: &str, muted: bool) -> Result<(), ServerError> {
        let mut state = self.state.lock().unwrap();
        state.mute_calls.push((name.to_string(), muted));
        if let Some(sink) = state.sinks.iter_mut().find(|s| s.name == name) {
            sink.muted = muted;
        }
        Ok(())
    }

    async fn set_default_sink(&self, name: &str) -> Result<(), ServerError> {
        self.state.lock().unwrap().default_sink = Some(name.to_string());
        Ok(())
    }

    async fn find_objects_with_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<ServerObjectId>, ServerError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .loaded
            .iter()
            .filter(|(_, name)| name.starts_with(prefix))
            .map(|(id, _)| ServerObjectId::single(*id))
            .collect())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<ServerEvent>, ServerError> {
        let (tx, rx) = mpsc::channel(64);
        *self.event_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }
}
