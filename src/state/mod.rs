//! Engine snapshots and their restore rules.
//!
//! A snapshot is one JSON document: global settings plus one entry per
//! object, tagged by processor id. The persistence actor stores the latest
//! snapshot in an embedded sled database with debouncing.

pub mod persistence_actor;

pub use persistence_actor::{PersistenceActor, PersistenceActorHandle, DEFAULT_DEBOUNCE_MS};

use crate::engine::{
    BridgeObject, ChangeKind, Core, DirectionSetting, ObjectKind, ParamId, Participant,
    ProcessorId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::debug;

/// Restore failures that leave the core untouched.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("unsupported snapshot version '{0}'")]
    UnsupportedVersion(String),
    #[error("snapshot contains processor id {0} more than once")]
    DuplicateProcessorId(ProcessorId),
}

/// Persisted state of one object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    pub processor_id: ProcessorId,
    pub kind: ObjectKind,
    pub object_id: u16,
    pub mapping_id: u8,
    pub direction: DirectionSetting,
    #[serde(default)]
    pub name: String,
    pub values: BTreeMap<ParamId, f32>,
}

impl ObjectSnapshot {
    fn of(obj: &BridgeObject) -> Self {
        Self {
            processor_id: obj.id,
            kind: obj.kind,
            object_id: obj.object_id,
            mapping_id: obj.mapping_id,
            direction: DirectionSetting::from_mode(obj.direction),
            name: obj.name.clone(),
            values: obj
                .kind
                .params()
                .iter()
                // Meter levels are transient telemetry, not worth persisting.
                .filter(|&&p| p != ParamId::Level)
                .map(|&p| (p, obj.value(p)))
                .collect(),
        }
    }
}

/// Persisted engine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    /// Snapshot format version.
    pub version: String,
    /// Milliseconds since epoch at capture time.
    pub timestamp: u64,
    pub extension_mode: crate::engine::ExtensionMode,
    pub active_side: crate::engine::ParallelSide,
    pub tick_ms: u64,
    pub online: bool,
    pub objects: Vec<ObjectSnapshot>,
}

impl EngineSnapshot {
    pub const VERSION: &'static str = "1";

    pub fn from_core(core: &Core) -> Self {
        Self {
            version: Self::VERSION.to_string(),
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            extension_mode: core.topology.mode(),
            active_side: core.topology.active_side(),
            tick_ms: core.tick_ms,
            online: core.online,
            objects: core.registry.iter().map(ObjectSnapshot::of).collect(),
        }
    }

    /// Load this snapshot into the core.
    ///
    /// Objects live in the core but absent from the snapshot are removed
    /// first, so restored ids never collide with stale ones. Restored values
    /// land as protocol writes: UI participants see them as changed, nothing
    /// is queued for retransmission. Addressing lands as a host write so the
    /// scheduler recomputes telemetry activation on the next tick.
    pub fn apply_to_core(&self, core: &mut Core) -> Result<(), SnapshotError> {
        if self.version != Self::VERSION {
            return Err(SnapshotError::UnsupportedVersion(self.version.clone()));
        }

        let mut seen = BTreeSet::new();
        for entry in &self.objects {
            if !seen.insert(entry.processor_id) {
                return Err(SnapshotError::DuplicateProcessorId(entry.processor_id));
            }
        }

        // Phase 1: drop everything the snapshot does not mention, and
        // anything whose kind changed under the same id.
        let stale: Vec<ProcessorId> = core
            .registry
            .iter()
            .filter(|obj| {
                self.objects
                    .iter()
                    .find(|e| e.processor_id == obj.id)
                    .map_or(true, |e| e.kind != obj.kind)
            })
            .map(|obj| obj.id)
            .collect();
        for id in &stale {
            core.registry.remove(*id);
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "removed objects absent from snapshot");
        }

        // Phase 2: update survivors and construct the rest.
        for entry in &self.objects {
            if core.registry.find(entry.processor_id).is_none() {
                core.registry
                    .insert_restored(BridgeObject::new(entry.processor_id, entry.kind));
            }
            let obj = core
                .registry
                .find_mut(entry.processor_id)
                .expect("restored object must exist");

            obj.set_object_id(entry.object_id, Participant::Host);
            obj.set_mapping_id(entry.mapping_id, Participant::Host);
            obj.set_direction(entry.direction.to_mode(), Participant::Host);
            for (&param, &value) in &entry.values {
                obj.set_value(param, value, Participant::Protocol);
            }
            obj.set_name(&entry.name, Participant::Protocol);
            // Construction marked every kind pending for the protocol;
            // restored values must not go back out as fresh edits.
            obj.changes
                .clear(Participant::Protocol, ChangeKind::PARAMS | ChangeKind::NAME);
        }

        core.topology.set_mode(self.extension_mode);
        core.topology.set_active_side(self.active_side);
        core.tick_ms = crate::engine::clamp_tick_ms(self.tick_ms);
        core.online = self.online;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DeviceTopology, ExtensionMode, ParallelSide};

    fn make_core() -> Core {
        Core::new(
            DeviceTopology::new(ExtensionMode::Off, ParallelSide::None),
            100,
            true,
        )
    }

    fn snapshot_entry(id: ProcessorId, kind: ObjectKind, object_id: u16) -> ObjectSnapshot {
        ObjectSnapshot {
            processor_id: id,
            kind,
            object_id,
            mapping_id: if kind == ObjectKind::SoundObject { 1 } else { 0 },
            direction: DirectionSetting::Both,
            name: String::new(),
            values: BTreeMap::new(),
        }
    }

    #[test]
    fn round_trips_objects_and_settings() {
        let mut core = make_core();
        core.topology.set_mode(ExtensionMode::Extend);
        core.tick_ms = 250;
        let id = core.registry.create(ObjectKind::SoundObject);
        {
            let obj = core.registry.find_mut(id).unwrap();
            obj.set_object_id(80, Participant::Host);
            obj.set_value(ParamId::PosX, 0.3, Participant::Host);
            obj.set_name("Solo", Participant::Host);
        }

        let snap = EngineSnapshot::from_core(&core);
        assert_eq!(snap.version, EngineSnapshot::VERSION);
        assert_eq!(snap.objects.len(), 1);

        let mut fresh = make_core();
        snap.apply_to_core(&mut fresh).unwrap();

        assert_eq!(fresh.topology.mode(), ExtensionMode::Extend);
        assert_eq!(fresh.tick_ms, 250);
        let obj = fresh.registry.find(id).unwrap();
        assert_eq!(obj.object_id, 80);
        assert_eq!(obj.value(ParamId::PosX), 0.3);
        assert_eq!(obj.name, "Solo");
    }

    #[test]
    fn restore_removes_stale_objects_first() {
        let mut core = make_core();
        let keep = core.registry.create(ObjectKind::MatrixInput);
        let stale = core.registry.create(ObjectKind::MatrixInput);

        let snap = EngineSnapshot {
            version: EngineSnapshot::VERSION.to_string(),
            timestamp: 0,
            extension_mode: ExtensionMode::Off,
            active_side: ParallelSide::None,
            tick_ms: 100,
            online: true,
            objects: vec![
                snapshot_entry(keep, ObjectKind::MatrixInput, 3),
                // Reuses the stale object's id for a different kind.
                snapshot_entry(stale, ObjectKind::MatrixOutput, 4),
            ],
        };
        snap.apply_to_core(&mut core).unwrap();

        assert_eq!(core.registry.counts(), (0, 1, 1));
        assert_eq!(core.registry.find(keep).unwrap().object_id, 3);
        assert_eq!(core.registry.find(stale).unwrap().kind, ObjectKind::MatrixOutput);
    }

    #[test]
    fn restored_values_are_not_queued_for_transmit() {
        let mut core = make_core();
        let snap = EngineSnapshot {
            version: EngineSnapshot::VERSION.to_string(),
            timestamp: 0,
            extension_mode: ExtensionMode::Off,
            active_side: ParallelSide::None,
            tick_ms: 100,
            online: true,
            objects: vec![{
                let mut e = snapshot_entry(1, ObjectKind::SoundObject, 5);
                e.values.insert(ParamId::Spread, 0.4);
                e
            }],
        };
        snap.apply_to_core(&mut core).unwrap();

        let obj = core.registry.find(1).unwrap();
        assert_eq!(obj.value(ParamId::Spread), 0.4);
        // UI participants must redraw; the protocol must not retransmit.
        assert!(obj
            .changes
            .is_changed(Participant::TablePage, ChangeKind::SPREAD));
        assert!(!obj
            .changes
            .is_changed(Participant::Protocol, ChangeKind::PARAMS));
        // Addressing stays pending so activation is recomputed.
        assert!(obj
            .changes
            .is_changed(Participant::Protocol, ChangeKind::ADDRESSING));
    }

    #[test]
    fn version_and_duplicate_checks_reject_the_snapshot() {
        let mut core = make_core();
        core.registry.create(ObjectKind::SoundObject);

        let bad_version = EngineSnapshot {
            version: "0".to_string(),
            timestamp: 0,
            extension_mode: ExtensionMode::Off,
            active_side: ParallelSide::None,
            tick_ms: 100,
            online: true,
            objects: vec![],
        };
        assert!(matches!(
            bad_version.apply_to_core(&mut core),
            Err(SnapshotError::UnsupportedVersion(_))
        ));

        let duplicate = EngineSnapshot {
            version: EngineSnapshot::VERSION.to_string(),
            timestamp: 0,
            extension_mode: ExtensionMode::Off,
            active_side: ParallelSide::None,
            tick_ms: 100,
            online: true,
            objects: vec![
                snapshot_entry(2, ObjectKind::MatrixInput, 1),
                snapshot_entry(2, ObjectKind::MatrixInput, 2),
            ],
        };
        assert!(matches!(
            duplicate.apply_to_core(&mut core),
            Err(SnapshotError::DuplicateProcessorId(2))
        ));
        // Rejected snapshots leave the core untouched.
        assert_eq!(core.registry.len(), 1);
    }

    #[test]
    fn snapshot_interval_is_clamped_on_restore() {
        let mut core = make_core();
        let snap = EngineSnapshot {
            version: EngineSnapshot::VERSION.to_string(),
            timestamp: 0,
            extension_mode: ExtensionMode::Off,
            active_side: ParallelSide::None,
            tick_ms: 7,
            online: false,
            objects: vec![],
        };
        snap.apply_to_core(&mut core).unwrap();
        assert_eq!(core.tick_ms, 20);
        assert!(!core.online);
    }
}
