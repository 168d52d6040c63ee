//! Per-tick dispatch pass: drain protocol dirty flags into outbound traffic.
//!
//! The pass itself is synchronous and runs under the engine mutex; the
//! ticker task performs the actual transport I/O afterwards, outside the
//! lock.

use super::flags::{ChangeKind, Participant};
use super::object::{BridgeObject, DirectionMode, ObjectKind, ParamId};
use super::Core;
use crate::protocol::{DeviceIndex, MsgAddr, SubscriptionSet, WireMessage};
use tracing::{debug, trace};

/// Everything one tick decided to do.
#[derive(Debug, Default)]
pub(crate) struct TickOutput {
    /// Outbound messages, already translated to device-local addresses.
    pub(crate) sends: Vec<(DeviceIndex, WireMessage)>,
    /// Full replacement subscription sets, present only when stale.
    pub(crate) subscriptions: Option<Vec<(DeviceIndex, SubscriptionSet)>>,
}

/// Run one dispatch tick over the locked core.
pub(crate) fn run_tick(core: &mut Core) -> TickOutput {
    let mut out = TickOutput::default();

    if !core.online {
        // Offline: gestures still decay and grace masks expire, but dirty
        // flags keep accumulating until polling resumes.
        for obj in core.registry.iter_mut() {
            obj.tick();
            obj.in_transit = ChangeKind::empty();
        }
        return out;
    }

    // Global changes the protocol cares about. Everything else addressed to
    // the protocol word (tab, selection) has no outbound representation and
    // is discarded here so it cannot sit pending forever.
    let global = core.changes.pop(Participant::Protocol, ChangeKind::all());
    let mut subs_stale =
        global.intersects(ChangeKind::OBJECT_COUNT | ChangeKind::DEVICE_CONFIG);

    for obj in core.registry.iter_mut() {
        // Addressing changes first: they decide telemetry participation.
        let cfg = obj
            .changes
            .pop(Participant::Protocol, ChangeKind::ADDRESSING);
        if !cfg.is_empty() {
            let flipped = obj.refresh_remote_active();
            if flipped || obj.remote_active {
                subs_stale = true;
            }
        }

        // Gesture upkeep runs every tick, dirty or not.
        obj.tick();

        let mut sent = ChangeKind::empty();
        if obj.direction.contains(DirectionMode::TX) {
            for &kind in obj.kind.tx_kinds() {
                if obj.changes.pop(Participant::Protocol, kind).is_empty() {
                    continue;
                }
                let Some(msg) = message_for(obj, kind) else {
                    continue;
                };
                let routes = core.topology.outbound_routes(obj.object_id);
                if routes.is_empty() {
                    debug!(
                        object_id = obj.object_id,
                        mode = core.topology.mode().label(),
                        "object unreachable in current extension mode, dropping update"
                    );
                    continue;
                }
                for (device, raw) in routes {
                    let mut routed = msg.clone();
                    routed.addr.object = raw;
                    out.sends.push((device, routed));
                }
                sent |= kind;
            }
        }

        // The grace mask covers exactly what this tick put on the wire.
        obj.in_transit = sent;
    }

    if subs_stale {
        let subs = build_subscriptions(core);
        trace!(devices = subs.len(), "subscription sets rebuilt");
        out.subscriptions = Some(subs);
    }

    out
}

/// Build the outbound message for one dirty kind, addressed logically.
fn message_for(obj: &BridgeObject, kind: ChangeKind) -> Option<WireMessage> {
    let addr = MsgAddr {
        object: obj.object_id,
        mapping: obj.mapping_id,
    };

    let msg = if kind == ChangeKind::POSITION {
        WireMessage::xy(addr, obj.value(ParamId::PosX), obj.value(ParamId::PosY))
    } else if kind == ChangeKind::REVERB_SEND {
        WireMessage::float(
            crate::protocol::RemoteKind::ReverbSend,
            addr,
            obj.value(ParamId::ReverbSend),
        )
    } else if kind == ChangeKind::SPREAD {
        WireMessage::float(
            crate::protocol::RemoteKind::Spread,
            addr,
            obj.value(ParamId::Spread),
        )
    } else if kind == ChangeKind::DELAY_MODE {
        WireMessage::int(
            crate::protocol::RemoteKind::DelayMode,
            addr,
            obj.value(ParamId::DelayMode) as i32,
        )
    } else if kind == ChangeKind::GAIN {
        let remote = match obj.kind {
            ObjectKind::MatrixInput => crate::protocol::RemoteKind::InputGain,
            ObjectKind::MatrixOutput => crate::protocol::RemoteKind::OutputGain,
            ObjectKind::SoundObject => return None,
        };
        WireMessage::float(remote, addr, obj.value(ParamId::Gain))
    } else if kind == ChangeKind::MUTE {
        let remote = match obj.kind {
            ObjectKind::MatrixInput => crate::protocol::RemoteKind::InputMute,
            ObjectKind::MatrixOutput => crate::protocol::RemoteKind::OutputMute,
            ObjectKind::SoundObject => return None,
        };
        WireMessage::int(remote, addr, obj.value(ParamId::Mute) as i32)
    } else {
        return None;
    };

    Some(msg)
}

/// Full per-device subscription sets for every telemetry-active object.
fn build_subscriptions(core: &Core) -> Vec<(DeviceIndex, SubscriptionSet)> {
    let mut first = SubscriptionSet::new();
    let mut second = SubscriptionSet::new();

    for obj in core.registry.iter() {
        if !obj.remote_active {
            continue;
        }
        for (device, raw) in core.topology.outbound_routes(obj.object_id) {
            let set = match device {
                DeviceIndex::First => &mut first,
                DeviceIndex::Second => &mut second,
            };
            match obj.kind {
                ObjectKind::SoundObject => {
                    set.sound_objects.insert((raw, obj.mapping_id));
                }
                ObjectKind::MatrixInput => {
                    set.inputs.insert(raw);
                }
                ObjectKind::MatrixOutput => {
                    set.outputs.insert(raw);
                }
            }
        }
    }

    // Always ship the first set, even empty, so a drained registry clears
    // the device side. The second set only exists when the mode uses it.
    let mut subs = vec![(DeviceIndex::First, first)];
    if core.topology.uses_second_device() {
        subs.push((DeviceIndex::Second, second));
    }
    subs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::topology::{DeviceTopology, ExtensionMode, ParallelSide};
    use crate::protocol::PayloadValue;

    fn make_core(mode: ExtensionMode) -> Core {
        Core::new(DeviceTopology::new(mode, ParallelSide::None), 100, true)
    }

    fn sends_of_kind(
        out: &TickOutput,
        kind: crate::protocol::RemoteKind,
    ) -> Vec<(DeviceIndex, WireMessage)> {
        out.sends
            .iter()
            .filter(|(_, m)| m.kind == kind)
            .cloned()
            .collect()
    }

    #[test]
    fn dirty_tx_object_transmits_combined_position() {
        let mut core = make_core(ExtensionMode::Off);
        let id = core.registry.create(ObjectKind::SoundObject);
        {
            let obj = core.registry.find_mut(id).unwrap();
            obj.set_object_id(5, Participant::Host);
            obj.set_direction(DirectionMode::RX | DirectionMode::TX, Participant::Host);
        }

        // First tick drains the construction defaults.
        let out = run_tick(&mut core);
        assert_eq!(out.sends.len(), 4);

        {
            let obj = core.registry.find_mut(id).unwrap();
            obj.set_value(ParamId::PosX, 0.25, Participant::SurfacePage);
            obj.set_value(ParamId::PosY, 0.75, Participant::SurfacePage);
        }
        let out = run_tick(&mut core);

        assert_eq!(out.sends.len(), 1);
        let (device, msg) = &out.sends[0];
        assert_eq!(*device, DeviceIndex::First);
        assert_eq!(msg.kind, crate::protocol::RemoteKind::PositionXy);
        assert_eq!(msg.addr.object, 5);
        assert_eq!(msg.addr.mapping, 1);
        assert_eq!(
            msg.payload,
            vec![PayloadValue::Float(0.25), PayloadValue::Float(0.75)]
        );

        let obj = core.registry.find(id).unwrap();
        assert_eq!(obj.in_transit, ChangeKind::POSITION);
    }

    #[test]
    fn integer_params_travel_as_ints() {
        let mut core = make_core(ExtensionMode::Off);
        let id = core.registry.create(ObjectKind::MatrixInput);
        {
            let obj = core.registry.find_mut(id).unwrap();
            obj.set_object_id(3, Participant::Host);
            obj.set_direction(DirectionMode::TX, Participant::Host);
        }
        run_tick(&mut core);

        core.registry
            .find_mut(id)
            .unwrap()
            .set_value(ParamId::Mute, 1.0, Participant::Host);
        let out = run_tick(&mut core);

        let mutes = sends_of_kind(&out, crate::protocol::RemoteKind::InputMute);
        assert_eq!(mutes.len(), 1);
        assert_eq!(mutes[0].1.payload, vec![PayloadValue::Int(1)]);
    }

    #[test]
    fn rx_only_objects_keep_their_flags() {
        let mut core = make_core(ExtensionMode::Off);
        let id = core.registry.create(ObjectKind::SoundObject);
        {
            let obj = core.registry.find_mut(id).unwrap();
            obj.set_direction(DirectionMode::RX, Participant::Host);
            obj.set_value(ParamId::Spread, 0.4, Participant::Host);
        }

        let out = run_tick(&mut core);
        assert!(out.sends.is_empty());

        let obj = core.registry.find(id).unwrap();
        assert!(obj
            .changes
            .is_changed(Participant::Protocol, ChangeKind::SPREAD));
        assert_eq!(obj.in_transit, ChangeKind::empty());
    }

    #[test]
    fn in_transit_mask_lasts_exactly_one_tick() {
        let mut core = make_core(ExtensionMode::Off);
        let id = core.registry.create(ObjectKind::MatrixOutput);
        {
            let obj = core.registry.find_mut(id).unwrap();
            obj.set_direction(DirectionMode::TX, Participant::Host);
        }
        run_tick(&mut core);

        core.registry
            .find_mut(id)
            .unwrap()
            .set_value(ParamId::Gain, -3.0, Participant::Host);
        run_tick(&mut core);
        assert_eq!(
            core.registry.find(id).unwrap().in_transit,
            ChangeKind::GAIN
        );

        // A quiet tick clears the grace mask.
        run_tick(&mut core);
        assert_eq!(core.registry.find(id).unwrap().in_transit, ChangeKind::empty());
    }

    #[test]
    fn offline_ticks_accumulate_and_resume_with_latest_value() {
        let mut core = make_core(ExtensionMode::Off);
        let id = core.registry.create(ObjectKind::MatrixInput);
        {
            let obj = core.registry.find_mut(id).unwrap();
            obj.set_object_id(9, Participant::Host);
            obj.set_direction(DirectionMode::TX, Participant::Host);
        }
        run_tick(&mut core);

        core.online = false;
        {
            let obj = core.registry.find_mut(id).unwrap();
            obj.set_value(ParamId::Gain, -10.0, Participant::Host);
        }
        assert!(run_tick(&mut core).sends.is_empty());
        {
            let obj = core.registry.find_mut(id).unwrap();
            obj.set_value(ParamId::Gain, -6.0, Participant::Host);
        }
        assert!(run_tick(&mut core).sends.is_empty());

        core.online = true;
        let out = run_tick(&mut core);
        assert_eq!(out.sends.len(), 1);
        assert_eq!(out.sends[0].1.payload, vec![PayloadValue::Float(-6.0)]);

        // The coalesced flag is spent now.
        assert!(run_tick(&mut core).sends.is_empty());
    }

    #[test]
    fn extend_mode_translates_outbound_addresses() {
        let mut core = make_core(ExtensionMode::Extend);
        let id = core.registry.create(ObjectKind::SoundObject);
        {
            let obj = core.registry.find_mut(id).unwrap();
            obj.set_object_id(80, Participant::Host);
            obj.set_direction(DirectionMode::TX, Participant::Host);
        }
        run_tick(&mut core);

        {
            let obj = core.registry.find_mut(id).unwrap();
            obj.set_value(ParamId::PosX, 0.1, Participant::Host);
        }
        let out = run_tick(&mut core);
        assert_eq!(out.sends.len(), 1);
        assert_eq!(out.sends[0].0, DeviceIndex::Second);
        assert_eq!(out.sends[0].1.addr.object, 16);
    }

    #[test]
    fn mirror_mode_fans_out_to_both_devices() {
        let mut core = make_core(ExtensionMode::Mirror);
        let id = core.registry.create(ObjectKind::MatrixInput);
        {
            let obj = core.registry.find_mut(id).unwrap();
            obj.set_object_id(2, Participant::Host);
            obj.set_direction(DirectionMode::TX, Participant::Host);
        }
        run_tick(&mut core);

        core.registry
            .find_mut(id)
            .unwrap()
            .set_value(ParamId::Gain, 1.5, Participant::Host);
        let out = run_tick(&mut core);

        assert_eq!(out.sends.len(), 2);
        let devices: Vec<DeviceIndex> = out.sends.iter().map(|(d, _)| *d).collect();
        assert!(devices.contains(&DeviceIndex::First));
        assert!(devices.contains(&DeviceIndex::Second));
    }

    #[test]
    fn unreachable_object_drops_the_update() {
        let mut core = make_core(ExtensionMode::Off);
        let id = core.registry.create(ObjectKind::SoundObject);
        {
            let obj = core.registry.find_mut(id).unwrap();
            obj.set_object_id(80, Participant::Host);
            obj.set_direction(DirectionMode::TX, Participant::Host);
        }

        let out = run_tick(&mut core);
        assert!(out.sends.is_empty());
        assert_eq!(core.registry.find(id).unwrap().in_transit, ChangeKind::empty());
    }

    #[test]
    fn addressing_change_rebuilds_subscriptions_once() {
        let mut core = make_core(ExtensionMode::Extend);
        let a = core.registry.create(ObjectKind::SoundObject);
        let b = core.registry.create(ObjectKind::MatrixInput);
        {
            let obj = core.registry.find_mut(a).unwrap();
            obj.set_object_id(80, Participant::Host);
            obj.set_direction(DirectionMode::RX, Participant::Host);
        }
        {
            let obj = core.registry.find_mut(b).unwrap();
            obj.set_object_id(2, Participant::Host);
            obj.set_direction(DirectionMode::RX, Participant::Host);
        }

        let out = run_tick(&mut core);
        let subs = out.subscriptions.expect("subscriptions should be stale");
        assert_eq!(subs.len(), 2);

        let (_, first) = &subs[0];
        let (_, second) = &subs[1];
        assert!(first.inputs.contains(&2));
        assert!(second.sound_objects.contains(&(16, 1)));

        // Nothing changed: no rebuild on the next tick.
        let out = run_tick(&mut core);
        assert!(out.subscriptions.is_none());
    }

    #[test]
    fn emptied_registry_pushes_empty_subscriptions() {
        let mut core = make_core(ExtensionMode::Off);
        let id = core.registry.create(ObjectKind::MatrixInput);
        {
            let obj = core.registry.find_mut(id).unwrap();
            obj.set_direction(DirectionMode::RX, Participant::Host);
        }
        run_tick(&mut core);

        core.registry.remove(id);
        // The engine marks the count change when it removes an object.
        core.changes.mark(Participant::Host, ChangeKind::OBJECT_COUNT);

        let out = run_tick(&mut core);
        let subs = out.subscriptions.expect("removal must refresh subscriptions");
        assert_eq!(subs.len(), 1);
        assert!(subs[0].1.is_empty());
    }
}
