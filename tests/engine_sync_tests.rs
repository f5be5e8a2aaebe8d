// Event-path tests: echo suppression, external change propagation,
// state retention across a server restart and notification batching.
//
// These depend on the real debounce and suppression windows, so they
// run serialized to keep the timing honest under load.

mod support;

use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use soundmux::{
    AudioServer, Engine, EngineConfig, EngineError, Notification, ServerEvent, ValueField,
};
use support::{drain_notifications, FakeServer};

async fn start(server: &Arc<FakeServer>) -> Engine {
    let server: Arc<dyn AudioServer> = server.clone();
    Engine::start(server, EngineConfig::default())
        .await
        .expect("engine start")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(250)).await;
}

fn value_changes(notifications: &[Notification], device: &str, field: ValueField) -> usize {
    notifications
        .iter()
        .filter(|n| {
            matches!(n, Notification::DeviceValueChanged { name, field: f }
                if name == device && *f == field)
        })
        .count()
}

#[tokio::test]
#[serial]
async fn echoed_volume_event_is_suppressed() {
    let server = Arc::new(FakeServer::new());
    server.add_sink(1, "analog_out", "Built-in Audio Analog Stereo");
    server.set_default("analog_out");

    let engine = start(&server).await;
    settle().await;
    let mut notifications = engine.subscribe();

    engine.set_volume("analog_out", 0.42).await.unwrap();
    assert_eq!(server.volume_calls().len(), 1);

    // The server reports our own change back. It must not loop around.
    server
        .push_event(ServerEvent::VolumeChanged {
            name: "analog_out".to_string(),
            volume: 0.42,
        })
        .await;
    settle().await;

    let seen = drain_notifications(&mut notifications);
    assert_eq!(value_changes(&seen, "analog_out", ValueField::Volume), 1);
    assert_eq!(server.volume_calls().len(), 1);

    let devices = engine.devices().await.unwrap();
    assert!((devices[0].volume - 0.42).abs() < 1e-6);

    engine.shutdown().await;
}

#[tokio::test]
#[serial]
async fn event_pushed_immediately_after_start_is_delivered() {
    let server = Arc::new(FakeServer::new());
    server.add_sink(1, "analog_out", "Built-in Audio Analog Stereo");
    server.set_default("analog_out");

    let engine = start(&server).await;

    // No settling first: the subscription must be live by the time
    // start() returns.
    server
        .push_event(ServerEvent::VolumeChanged {
            name: "analog_out".to_string(),
            volume: 0.2,
        })
        .await;
    settle().await;

    let devices = engine.devices().await.unwrap();
    assert!((devices[0].volume - 0.2).abs() < 1e-6);

    engine.shutdown().await;
}

#[tokio::test]
#[serial]
async fn external_volume_change_updates_catalog_without_command() {
    let server = Arc::new(FakeServer::new());
    server.add_sink(1, "analog_out", "Built-in Audio Analog Stereo");
    server.set_default("analog_out");

    let engine = start(&server).await;
    let mut notifications = engine.subscribe();

    // Someone turned the knob in another mixer.
    server
        .push_event(ServerEvent::VolumeChanged {
            name: "analog_out".to_string(),
            volume: 0.3,
        })
        .await;
    settle().await;

    let seen = drain_notifications(&mut notifications);
    assert_eq!(value_changes(&seen, "analog_out", ValueField::Volume), 1);
    assert!(server.volume_calls().is_empty());
    let devices = engine.devices().await.unwrap();
    assert!((devices[0].volume - 0.3).abs() < 1e-6);

    engine.shutdown().await;
}

#[tokio::test]
#[serial]
async fn event_disagreeing_with_recent_intent_is_applied() {
    let server = Arc::new(FakeServer::new());
    server.add_sink(1, "analog_out", "Built-in Audio Analog Stereo");
    server.set_default("analog_out");

    let engine = start(&server).await;

    engine.set_volume("analog_out", 0.5).await.unwrap();
    // Different value: a genuine external change, not an echo.
    server
        .push_event(ServerEvent::VolumeChanged {
            name: "analog_out".to_string(),
            volume: 0.9,
        })
        .await;
    settle().await;

    let devices = engine.devices().await.unwrap();
    assert!((devices[0].volume - 0.9).abs() < 1e-6);
    assert_eq!(server.volume_calls().len(), 1);

    engine.shutdown().await;
}

#[tokio::test]
#[serial]
async fn echoed_mute_event_is_suppressed_once() {
    let server = Arc::new(FakeServer::new());
    server.add_sink(1, "analog_out", "Built-in Audio Analog Stereo");
    server.set_default("analog_out");

    let engine = start(&server).await;

    engine.set_mute("analog_out", true).await.unwrap();
    assert_eq!(server.mute_calls().len(), 1);

    server
        .push_event(ServerEvent::MuteChanged {
            name: "analog_out".to_string(),
            muted: true,
        })
        .await;
    // The record is consumed by the echo; a later external unmute lands.
    server
        .push_event(ServerEvent::MuteChanged {
            name: "analog_out".to_string(),
            muted: false,
        })
        .await;
    settle().await;

    let devices = engine.devices().await.unwrap();
    assert!(!devices[0].muted);
    assert_eq!(server.mute_calls().len(), 1);

    engine.shutdown().await;
}

#[tokio::test]
#[serial]
async fn value_intent_on_unrouted_device_stays_local() {
    let server = Arc::new(FakeServer::new());
    server.add_sink(1, "analog_out", "Built-in Audio Analog Stereo");
    server.add_sink(2, "hdmi_out", "HDMI Output");
    server.set_default("analog_out");

    let engine = start(&server).await;

    engine.set_volume("hdmi_out", 0.25).await.unwrap();

    // Not part of the routing set: catalog only, no server command.
    assert!(server.volume_calls().is_empty());
    let devices = engine.devices().await.unwrap();
    let hdmi = devices.iter().find(|d| d.name == "hdmi_out").unwrap();
    assert!((hdmi.volume - 0.25).abs() < 1e-6);

    engine.shutdown().await;
}

#[tokio::test]
#[serial]
async fn server_restart_preserves_device_state_by_name() {
    let server = Arc::new(FakeServer::new());
    server.add_sink(1, "analog_out", "Built-in Audio Analog Stereo");
    server.add_sink(2, "usb_dac", "USB DAC");
    server.set_default("analog_out");

    let engine = start(&server).await;
    engine.set_volume("analog_out", 0.6).await.unwrap();
    let builds_before = server.combined_created();

    // Server restart: everything disappears...
    server
        .push_event(ServerEvent::Removed {
            name: "analog_out".to_string(),
        })
        .await;
    server
        .push_event(ServerEvent::Removed {
            name: "usb_dac".to_string(),
        })
        .await;
    settle().await;
    assert_eq!(server.null_created(), 1);
    assert_eq!(engine.devices().await.unwrap().len(), 0);

    // ...and comes back with fresh indices and default volumes.
    server
        .push_event(ServerEvent::Discovered {
            sink: FakeServer::sink(77, "analog_out", "Built-in Audio Analog Stereo"),
        })
        .await;
    server
        .push_event(ServerEvent::Discovered {
            sink: FakeServer::sink(78, "usb_dac", "USB DAC"),
        })
        .await;
    settle().await;

    let devices = engine.devices().await.unwrap();
    let analog = devices.iter().find(|d| d.name == "analog_out").unwrap();
    assert!(analog.enabled);
    assert_eq!(analog.index, 77);
    assert!((analog.volume - 0.6).abs() < 1e-6);
    let usb = devices.iter().find(|d| d.name == "usb_dac").unwrap();
    assert!(!usb.enabled);

    // Exactly one rebuild for the returning routed device.
    assert_eq!(server.combined_created(), builds_before + 1);

    engine.shutdown().await;
}

#[tokio::test]
#[serial]
async fn event_burst_collapses_into_one_list_notification() {
    let server = Arc::new(FakeServer::new());
    server.add_sink(1, "analog_out", "Built-in Audio Analog Stereo");
    server.set_default("analog_out");

    let engine = start(&server).await;
    let mut notifications = engine.subscribe();

    for i in 0..4u32 {
        server
            .push_event(ServerEvent::Discovered {
                sink: FakeServer::sink(10 + i, &format!("port_{i}"), "USB DAC"),
            })
            .await;
    }
    settle().await;

    let list_changes = drain_notifications(&mut notifications)
        .iter()
        .filter(|n| matches!(n, Notification::DeviceListChanged))
        .count();
    assert_eq!(list_changes, 1);
    assert_eq!(engine.devices().await.unwrap().len(), 5);

    engine.shutdown().await;
}

#[tokio::test]
#[serial]
async fn invalid_intents_are_rejected() {
    let server = Arc::new(FakeServer::new());
    server.add_sink(1, "analog_out", "Built-in Audio Analog Stereo");
    server.set_default("analog_out");

    let engine = start(&server).await;

    let err = engine.set_volume("analog_out", 1.5).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidIntent(_)));
    let err = engine.set_volume("ghost", 0.5).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidIntent(_)));
    let err = engine.set_enabled("ghost", true).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidIntent(_)));
    let err = engine.set_mute("ghost", true).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidIntent(_)));

    engine.shutdown().await;
}

#[tokio::test]
#[serial]
async fn sync_toggle_rebuilds_without_compensation() {
    let server = Arc::new(FakeServer::new());
    server.add_sink(1, "bt_speaker", "Bluetooth Speaker");
    server.add_sink(2, "usb_dac", "USB DAC");
    server.set_default("usb_dac");

    let engine = start(&server).await;
    engine.set_enabled("bt_speaker", true).await.unwrap();
    let builds = server.combined_created();

    engine.set_sync_compensation(false).await.unwrap();
    assert_eq!(server.combined_created(), builds + 1);
    let names = server.loaded_object_names();
    assert!(names.contains(&soundmux::topology::delay_stage_name("usb_dac", 0)));
    assert!(names.contains(&soundmux::topology::delay_stage_name("bt_speaker", 0)));

    // Setting the same value again is a no-op.
    engine.set_sync_compensation(false).await.unwrap();
    assert_eq!(server.combined_created(), builds + 1);

    engine.shutdown().await;
}
