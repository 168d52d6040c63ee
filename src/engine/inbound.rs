//! Inbound router: device traffic into engine state.
//!
//! Order of business for every message: classify, resolve the source device
//! against the topology, then match objects and apply gates (grace mask,
//! direction, pending local edits) before any value lands.

use super::flags::{ChangeKind, Participant};
use super::object::{DirectionMode, ObjectKind, ParamId};
use super::selection::SelectionAccess;
use super::Core;
use crate::protocol::{InboundEnvelope, PayloadValue, RemoteKind, WireMessage};
use tracing::{debug, trace, warn};

/// What a message means for the engine.
enum MsgClass {
    /// Parameter value for one object family.
    Value { target: ObjectKind, kind: ChangeKind },
    /// Channel display name, fanned out across families.
    Name { targets: &'static [ObjectKind] },
    ObjectSelect,
    GroupSelect,
    TabSelect,
    DeviceMaster,
}

fn classify(kind: RemoteKind) -> MsgClass {
    match kind {
        RemoteKind::PositionXy => MsgClass::Value {
            target: ObjectKind::SoundObject,
            kind: ChangeKind::POSITION,
        },
        RemoteKind::ReverbSend => MsgClass::Value {
            target: ObjectKind::SoundObject,
            kind: ChangeKind::REVERB_SEND,
        },
        RemoteKind::Spread => MsgClass::Value {
            target: ObjectKind::SoundObject,
            kind: ChangeKind::SPREAD,
        },
        RemoteKind::DelayMode => MsgClass::Value {
            target: ObjectKind::SoundObject,
            kind: ChangeKind::DELAY_MODE,
        },
        RemoteKind::InputGain => MsgClass::Value {
            target: ObjectKind::MatrixInput,
            kind: ChangeKind::GAIN,
        },
        RemoteKind::InputMute => MsgClass::Value {
            target: ObjectKind::MatrixInput,
            kind: ChangeKind::MUTE,
        },
        RemoteKind::InputLevel => MsgClass::Value {
            target: ObjectKind::MatrixInput,
            kind: ChangeKind::LEVEL,
        },
        RemoteKind::OutputGain => MsgClass::Value {
            target: ObjectKind::MatrixOutput,
            kind: ChangeKind::GAIN,
        },
        RemoteKind::OutputMute => MsgClass::Value {
            target: ObjectKind::MatrixOutput,
            kind: ChangeKind::MUTE,
        },
        RemoteKind::OutputLevel => MsgClass::Value {
            target: ObjectKind::MatrixOutput,
            kind: ChangeKind::LEVEL,
        },
        RemoteKind::InputName => MsgClass::Name {
            targets: &[ObjectKind::SoundObject, ObjectKind::MatrixInput],
        },
        RemoteKind::OutputName => MsgClass::Name {
            targets: &[ObjectKind::MatrixOutput],
        },
        RemoteKind::ObjectSelect => MsgClass::ObjectSelect,
        RemoteKind::GroupSelect => MsgClass::GroupSelect,
        RemoteKind::TabSelect => MsgClass::TabSelect,
        RemoteKind::DeviceMaster => MsgClass::DeviceMaster,
    }
}

/// All-numeric payload of exactly `expected` elements, or `None`.
fn numeric_args(msg: &WireMessage, expected: usize) -> Option<Vec<f32>> {
    if msg.payload.len() != expected {
        return None;
    }
    msg.payload.iter().map(PayloadValue::as_f32).collect()
}

fn text_arg(msg: &WireMessage) -> Option<&str> {
    match msg.payload.as_slice() {
        [PayloadValue::Str(s)] => Some(s),
        _ => None,
    }
}

fn single_param(kind: ChangeKind) -> Option<ParamId> {
    if kind == ChangeKind::REVERB_SEND {
        Some(ParamId::ReverbSend)
    } else if kind == ChangeKind::SPREAD {
        Some(ParamId::Spread)
    } else if kind == ChangeKind::DELAY_MODE {
        Some(ParamId::DelayMode)
    } else if kind == ChangeKind::GAIN {
        Some(ParamId::Gain)
    } else if kind == ChangeKind::MUTE {
        Some(ParamId::Mute)
    } else if kind == ChangeKind::LEVEL {
        Some(ParamId::Level)
    } else {
        None
    }
}

/// Route one inbound message into the locked core.
///
/// Returns true when durable object state changed and a snapshot save is
/// worth scheduling. Meter levels and selection/tab traffic are transient
/// and never report true.
pub(crate) fn route_inbound(
    core: &mut Core,
    selection: &dyn SelectionAccess,
    env: &InboundEnvelope,
) -> bool {
    let msg = &env.msg;

    match classify(msg.kind) {
        MsgClass::DeviceMaster => {
            let Some(args) = numeric_args(msg, 1) else {
                warn!(kind = ?msg.kind, payload = ?msg.payload, "malformed master telemetry, dropping");
                return false;
            };
            if core.topology.note_master(env.device, args[0] != 0.0) {
                debug!(
                    device = env.device.label(),
                    "device master designation changed"
                );
                core.changes
                    .mark(Participant::Protocol, ChangeKind::DEVICE_CONFIG);
            }
            false
        }

        MsgClass::TabSelect => {
            let Some(args) = numeric_args(msg, 1) else {
                warn!(kind = ?msg.kind, payload = ?msg.payload, "malformed tab selection, dropping");
                return false;
            };
            let tab = args[0].clamp(0.0, 255.0) as u8;
            if core.remote_tab != tab {
                core.remote_tab = tab;
                core.changes
                    .mark(Participant::Protocol, ChangeKind::TAB_PAGE);
            }
            false
        }

        MsgClass::ObjectSelect => {
            let Some(effective) = core.topology.resolve_inbound(msg.addr.object, env.device)
            else {
                trace!(object = msg.addr.object, device = env.device.label(), "selection from non-authoritative device, dropping");
                return false;
            };
            let Some(args) = numeric_args(msg, 1) else {
                warn!(kind = ?msg.kind, payload = ?msg.payload, "malformed selection, dropping");
                return false;
            };
            let select = args[0] != 0.0;

            let mut any = false;
            for obj in core.registry.kind_iter(ObjectKind::SoundObject) {
                if obj.object_id == effective {
                    selection.set_selected(obj.id, select);
                    any = true;
                }
            }
            if any {
                core.changes
                    .mark(Participant::Protocol, ChangeKind::SELECTION);
            } else {
                debug!(object_id = effective, "selection for unknown object, ignoring");
            }
            false
        }

        MsgClass::GroupSelect => {
            // The group id is not a channel number, so only the accept half
            // of the resolver applies.
            if !core.topology.accepts_inbound(env.device) {
                trace!(group = msg.addr.object, device = env.device.label(), "group recall from non-authoritative device, dropping");
                return false;
            }
            let Some(args) = numeric_args(msg, 1) else {
                warn!(kind = ?msg.kind, payload = ?msg.payload, "malformed group recall, dropping");
                return false;
            };
            if args[0] == 0.0 {
                return false;
            }
            if selection.recall_group(msg.addr.object) {
                core.changes
                    .mark(Participant::Protocol, ChangeKind::SELECTION);
            }
            false
        }

        MsgClass::Name { targets } => {
            let Some(effective) = core.topology.resolve_inbound(msg.addr.object, env.device)
            else {
                trace!(object = msg.addr.object, device = env.device.label(), "name from non-authoritative device, dropping");
                return false;
            };
            let Some(name) = text_arg(msg) else {
                warn!(kind = ?msg.kind, payload = ?msg.payload, "malformed channel name, dropping");
                return false;
            };

            // Names bypass the value gates: no mapping check, no echo or
            // direction filtering, applied to every matching object.
            let mut mutated = false;
            for &target in targets {
                for obj in core.registry.kind_iter_mut(target) {
                    if obj.object_id == effective {
                        mutated |= obj.set_name(name, Participant::Protocol);
                    }
                }
            }
            if !mutated {
                debug!(object_id = effective, kind = ?msg.kind, "name for unknown object, ignoring");
            }
            mutated
        }

        MsgClass::Value { target, kind } => {
            let Some(effective) = core.topology.resolve_inbound(msg.addr.object, env.device)
            else {
                trace!(
                    object = msg.addr.object,
                    device = env.device.label(),
                    "value from non-authoritative device, dropping"
                );
                return false;
            };

            let expected = if kind == ChangeKind::POSITION { 2 } else { 1 };
            let Some(args) = numeric_args(msg, expected) else {
                warn!(
                    kind = ?msg.kind,
                    expected,
                    got = msg.payload.len(),
                    "malformed value payload, dropping"
                );
                return false;
            };

            let mut mutated = false;
            let mut matched = false;
            for obj in core.registry.kind_iter_mut(target) {
                if obj.object_id != effective {
                    continue;
                }
                // Coordinates are per mapping area; a mismatch is simply a
                // different object sharing the number.
                if kind == ChangeKind::POSITION && obj.mapping_id != msg.addr.mapping {
                    continue;
                }
                matched = true;

                if obj.in_transit.intersects(kind) {
                    trace!(id = obj.id, kind = ?msg.kind, "echo within grace window, dropping");
                    continue;
                }
                if !obj.direction.contains(DirectionMode::RX) {
                    trace!(id = obj.id, kind = ?msg.kind, "object not in Rx mode, dropping");
                    continue;
                }
                // A local edit awaiting transmit outranks a stale remote
                // value; only transmitting objects can have one pending.
                if obj.direction.contains(DirectionMode::TX)
                    && obj.changes.is_changed(Participant::Protocol, kind)
                {
                    trace!(id = obj.id, kind = ?msg.kind, "local edit pending transmit, dropping");
                    continue;
                }

                if kind == ChangeKind::POSITION {
                    mutated |= obj.set_value(ParamId::PosX, args[0], Participant::Protocol);
                    mutated |= obj.set_value(ParamId::PosY, args[1], Participant::Protocol);
                } else if let Some(param) = single_param(kind) {
                    mutated |= obj.set_value(param, args[0], Participant::Protocol);
                }
            }

            if !matched {
                debug!(object_id = effective, kind = ?msg.kind, "no object matches, ignoring");
            }

            // Meter telemetry is transient; don't wake persistence for it.
            mutated && kind != ChangeKind::LEVEL
        }
    }
}
