//! Cross-component scenarios: dispatch, inbound routing, removal contracts,
//! and snapshot persistence working together.

use super::inbound::route_inbound;
use super::scheduler::run_tick;
use super::*;
use crate::protocol::{DeviceIndex, InboundEnvelope, MsgAddr, PayloadValue, RemoteKind, WireMessage};
use crate::state::{PersistenceActor, EngineSnapshot};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn make_core(mode: ExtensionMode) -> Core {
    Core::new(DeviceTopology::new(mode, ParallelSide::None), 100, true)
}

fn envelope(device: DeviceIndex, msg: WireMessage) -> InboundEnvelope {
    InboundEnvelope { device, msg }
}

/// Full round trip: a fresh sound object is configured, edited by the
/// host, dispatched once, and shielded from its own echo.
#[test]
fn host_edit_dispatches_once_and_shields_the_echo() {
    let mut core = make_core(ExtensionMode::Off);
    let sel = InMemorySelection::new();

    // Freshly created objects are direction-off and transmit nothing.
    let id = core.registry.create(ObjectKind::SoundObject);
    assert!(run_tick(&mut core).sends.is_empty());

    {
        let obj = core.registry.find_mut(id).unwrap();
        obj.set_object_id(5, Participant::Host);
        obj.set_direction(DirectionMode::RX | DirectionMode::TX, Participant::Host);
    }
    // Enabling Tx drains the construction defaults once.
    run_tick(&mut core);

    core.registry
        .find_mut(id)
        .unwrap()
        .set_value(ParamId::PosX, 0.8, Participant::Host);
    let out = run_tick(&mut core);

    // Exactly one combined X/Y message, two floats, current mapping id.
    assert_eq!(out.sends.len(), 1);
    let (device, msg) = &out.sends[0];
    assert_eq!(*device, DeviceIndex::First);
    assert_eq!(msg.kind, RemoteKind::PositionXy);
    assert_eq!(msg.addr.object, 5);
    assert_eq!(msg.addr.mapping, 1);
    assert_eq!(
        msg.payload,
        vec![PayloadValue::Float(0.8), PayloadValue::Float(0.5)]
    );

    // The device echo for the same object arrives before the next tick.
    let echo = envelope(
        DeviceIndex::First,
        WireMessage::xy(MsgAddr::mapped(5, 1), 0.8, 0.9),
    );
    assert!(!route_inbound(&mut core, &sel, &echo));
    assert_eq!(core.registry.find(id).unwrap().value(ParamId::PosY), 0.5);

    // A message for an object number nobody owns is a silent no-op.
    let stray = envelope(
        DeviceIndex::First,
        WireMessage::xy(MsgAddr::mapped(6, 1), 0.1, 0.1),
    );
    assert!(!route_inbound(&mut core, &sel, &stray));
    assert_eq!(core.registry.len(), 1);
    assert_eq!(core.registry.find(id).unwrap().value(ParamId::PosX), 0.8);

    // One quiet tick later the grace window is spent and the device wins.
    run_tick(&mut core);
    let update = envelope(
        DeviceIndex::First,
        WireMessage::xy(MsgAddr::mapped(5, 1), 0.2, 0.9),
    );
    assert!(route_inbound(&mut core, &sel, &update));
    assert_eq!(core.registry.find(id).unwrap().value(ParamId::PosY), 0.9);
}

#[test]
fn extend_mode_round_trips_across_the_device_pair() {
    let mut core = make_core(ExtensionMode::Extend);
    let sel = InMemorySelection::new();

    let id = core.registry.create(ObjectKind::MatrixInput);
    {
        let obj = core.registry.find_mut(id).unwrap();
        obj.set_object_id(80, Participant::Host);
        obj.set_direction(DirectionMode::RX | DirectionMode::TX, Participant::Host);
    }
    run_tick(&mut core);

    // Outbound: logical 80 leaves as channel 16 on the second device.
    core.registry
        .find_mut(id)
        .unwrap()
        .set_value(ParamId::Gain, -9.0, Participant::Host);
    let out = run_tick(&mut core);
    assert_eq!(out.sends.len(), 1);
    assert_eq!(out.sends[0].0, DeviceIndex::Second);
    assert_eq!(out.sends[0].1.addr.object, 16);

    // Inbound from the second device maps back onto logical 80.
    run_tick(&mut core);
    let msg = envelope(
        DeviceIndex::Second,
        WireMessage::float(RemoteKind::InputGain, MsgAddr::object(16), -3.0),
    );
    assert!(route_inbound(&mut core, &sel, &msg));
    assert_eq!(core.registry.find(id).unwrap().value(ParamId::Gain), -3.0);
}

#[tokio::test]
async fn engine_creates_and_removes_through_the_host_api() {
    let engine = Arc::new(Engine::new(
        DeviceTopology::new(ExtensionMode::Off, ParallelSide::None),
        100,
        true,
    ));

    let a = engine.create_object(ObjectKind::SoundObject).await;
    let b = engine.create_object(ObjectKind::MatrixInput).await;
    assert_eq!((a, b), (0, 1));

    assert!(engine.set_object_id(a, 7, Participant::Host).await);
    assert!(
        engine
            .set_parameter(a, ParamId::Spread, 0.3, Participant::Host)
            .await
    );
    let view = engine.resolve(a).unwrap();
    assert_eq!(view.object_id, 7);
    assert!(view.values.contains(&(ParamId::Spread, 0.3)));

    assert!(engine.remove_object(a).await);
    assert!(engine.resolve(a).is_none());
    // Double removal is a legitimate race, absorbed silently.
    assert!(!engine.remove_object(a).await);

    let status = engine.status();
    assert_eq!(status.matrix_inputs, 1);
    assert_eq!(status.sound_objects, 0);
}

#[tokio::test]
async fn removal_scrubs_selection_before_the_id_is_recycled() {
    let engine = Arc::new(Engine::new(
        DeviceTopology::new(ExtensionMode::Off, ParallelSide::None),
        100,
        true,
    ));

    let a = engine.create_object(ObjectKind::SoundObject).await;
    let b = engine.create_object(ObjectKind::MatrixInput).await;
    engine.selection().set_selected(a, true);
    engine.selection().set_selected(b, true);

    assert!(engine.remove_object(a).await);
    let recycled = engine.create_object(ObjectKind::SoundObject).await;
    assert_eq!(recycled, a);
    // The fresh object must not inherit the removed object's selection.
    assert!(!engine.selection().is_selected(recycled));
    assert!(engine.selection().is_selected(b));

    engine.remove_batch(&[b]).await;
    assert!(!engine.selection().is_selected(b));
    engine.shutdown().await;
}

#[tokio::test]
async fn batch_removal_notifies_once_and_schedules_one_save() {
    let temp = tempdir().unwrap();
    let persistence = PersistenceActor::spawn(temp.path().join("state.sled"), 10_000).unwrap();

    let engine = Arc::new(Engine::new(
        DeviceTopology::new(ExtensionMode::Off, ParallelSide::None),
        100,
        true,
    ));
    engine.set_persistence(persistence.clone()).await;

    let notifications = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&notifications);
    engine
        .set_stale_refs_callback(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .await;

    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(engine.create_object(ObjectKind::MatrixOutput).await);
    }

    let saves_before = engine.status().saves_scheduled;
    let removed = engine.remove_batch(&ids).await;

    assert_eq!(removed, 4);
    assert_eq!(notifications.load(Ordering::SeqCst), 1);
    assert_eq!(engine.status().saves_scheduled, saves_before + 1);

    persistence.shutdown();
}

#[tokio::test]
async fn inbound_pump_applies_telemetry_to_the_registry() {
    let engine = Arc::new(Engine::new(
        DeviceTopology::new(ExtensionMode::Off, ParallelSide::None),
        // Long interval so the ticker stays out of this test's way.
        5000,
        true,
    ));
    let id = engine.create_object(ObjectKind::MatrixInput).await;
    engine.set_object_id(id, 3, Participant::Host).await;
    engine.set_direction(id, DirectionMode::RX, Participant::Host).await;
    engine.clone().start();

    let sender = engine.inbound_sender();
    sender
        .send(envelope(
            DeviceIndex::First,
            WireMessage::float(RemoteKind::InputGain, MsgAddr::object(3), -12.0),
        ))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let view = engine.resolve(id).unwrap();
    assert!(view.values.contains(&(ParamId::Gain, -12.0)));

    engine.shutdown().await;
}

#[tokio::test]
async fn snapshot_round_trip_through_the_persistence_actor() {
    let temp = tempdir().unwrap();
    let db_path = temp.path().join("state.sled");

    {
        let persistence = PersistenceActor::spawn(&db_path, 0).unwrap();
        let engine = Arc::new(Engine::new(
            DeviceTopology::new(ExtensionMode::Mirror, ParallelSide::None),
            200,
            true,
        ));
        engine.set_persistence(persistence).await;

        let id = engine.create_object(ObjectKind::SoundObject).await;
        engine.set_object_id(id, 12, Participant::Host).await;
        engine
            .set_parameter(id, ParamId::ReverbSend, -4.5, Participant::Host)
            .await;
        engine.save_now().await.unwrap();
        engine.shutdown().await;
    }

    // Give the first actor a moment to drop its sled lock.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let persistence = PersistenceActor::spawn(&db_path, 0).unwrap();
    let snapshot = persistence.load_snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.version, EngineSnapshot::VERSION);

    let engine = Arc::new(Engine::new(
        DeviceTopology::new(ExtensionMode::Off, ParallelSide::None),
        100,
        true,
    ));
    engine.restore_snapshot(&snapshot).await.unwrap();

    let status = engine.status();
    assert_eq!(status.mode, ExtensionMode::Mirror);
    assert_eq!(status.tick_ms, 200);
    let view = engine.resolve(1).unwrap();
    assert_eq!(view.object_id, 12);
    assert!(view.values.contains(&(ParamId::ReverbSend, -4.5)));

    persistence.shutdown();
}

#[tokio::test]
async fn settings_reload_clamps_and_marks_device_config() {
    let engine = Arc::new(Engine::new(
        DeviceTopology::new(ExtensionMode::Off, ParallelSide::None),
        100,
        true,
    ));

    engine
        .apply_settings(ExtensionMode::Parallel, ParallelSide::Second, 9999, false)
        .await;

    let status = engine.status();
    assert_eq!(status.mode, ExtensionMode::Parallel);
    assert_eq!(status.active_side, ParallelSide::Second);
    assert_eq!(status.tick_ms, 5000);
    assert!(!status.online);

    let core = engine.core();
    let mut core = core.lock();
    assert!(core
        .changes
        .is_changed(Participant::SettingsPage, ChangeKind::DEVICE_CONFIG));
    assert!(!core
        .changes
        .pop(Participant::Protocol, ChangeKind::DEVICE_CONFIG)
        .is_empty());
}
