//! Object registry: the three bridged collections and id allocation.

use super::object::{BridgeObject, ObjectKind, ProcessorId};
use std::collections::BTreeSet;
use tracing::debug;

/// Owns every live [`BridgeObject`], split by kind.
///
/// Processor ids are shared across all three collections: the allocator
/// returns the smallest id no live object of any kind holds, starting from
/// zero, so removals leave gaps that are filled first.
///
/// Removal is two-phase: `remove` unlinks the object and hands it to the
/// caller, who notifies reference holders before letting it drop.
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    sound_objects: Vec<BridgeObject>,
    matrix_inputs: Vec<BridgeObject>,
    matrix_outputs: Vec<BridgeObject>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn collection_mut(&mut self, kind: ObjectKind) -> &mut Vec<BridgeObject> {
        match kind {
            ObjectKind::SoundObject => &mut self.sound_objects,
            ObjectKind::MatrixInput => &mut self.matrix_inputs,
            ObjectKind::MatrixOutput => &mut self.matrix_outputs,
        }
    }

    /// Smallest non-negative processor id not currently in use.
    pub fn next_free_id(&self) -> ProcessorId {
        let used: BTreeSet<ProcessorId> = self.iter().map(|o| o.id).collect();
        let mut candidate: ProcessorId = 0;
        while used.contains(&candidate) {
            candidate += 1;
        }
        candidate
    }

    /// Construct a new object of `kind` and return its id.
    pub fn create(&mut self, kind: ObjectKind) -> ProcessorId {
        let id = self.next_free_id();
        debug!("creating {} with processor id {}", kind.label(), id);
        self.collection_mut(kind).push(BridgeObject::new(id, kind));
        id
    }

    /// Re-insert an object with a preserved id, for snapshot restore.
    ///
    /// The caller guarantees the id is not live.
    pub fn insert_restored(&mut self, obj: BridgeObject) {
        debug_assert!(self.find(obj.id).is_none(), "duplicate processor id {}", obj.id);
        let kind = obj.kind;
        self.collection_mut(kind).push(obj);
    }

    /// Unlink the object with `id`, handing ownership to the caller.
    ///
    /// Returns `None` for unknown ids; that is a silent no-op by contract.
    pub fn remove(&mut self, id: ProcessorId) -> Option<BridgeObject> {
        for kind in [
            ObjectKind::SoundObject,
            ObjectKind::MatrixInput,
            ObjectKind::MatrixOutput,
        ] {
            let coll = self.collection_mut(kind);
            if let Some(pos) = coll.iter().position(|o| o.id == id) {
                debug!("removing {} with processor id {}", kind.label(), id);
                return Some(coll.remove(pos));
            }
        }
        None
    }

    pub fn find(&self, id: ProcessorId) -> Option<&BridgeObject> {
        self.iter().find(|o| o.id == id)
    }

    pub fn find_mut(&mut self, id: ProcessorId) -> Option<&mut BridgeObject> {
        self.iter_mut().find(|o| o.id == id)
    }

    /// All live objects, sound objects first.
    pub fn iter(&self) -> impl Iterator<Item = &BridgeObject> {
        self.sound_objects
            .iter()
            .chain(self.matrix_inputs.iter())
            .chain(self.matrix_outputs.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut BridgeObject> {
        self.sound_objects
            .iter_mut()
            .chain(self.matrix_inputs.iter_mut())
            .chain(self.matrix_outputs.iter_mut())
    }

    pub fn kind_iter(&self, kind: ObjectKind) -> std::slice::Iter<'_, BridgeObject> {
        match kind {
            ObjectKind::SoundObject => self.sound_objects.iter(),
            ObjectKind::MatrixInput => self.matrix_inputs.iter(),
            ObjectKind::MatrixOutput => self.matrix_outputs.iter(),
        }
    }

    pub fn kind_iter_mut(&mut self, kind: ObjectKind) -> std::slice::IterMut<'_, BridgeObject> {
        match kind {
            ObjectKind::SoundObject => self.sound_objects.iter_mut(),
            ObjectKind::MatrixInput => self.matrix_inputs.iter_mut(),
            ObjectKind::MatrixOutput => self.matrix_outputs.iter_mut(),
        }
    }

    pub fn len(&self) -> usize {
        self.sound_objects.len() + self.matrix_inputs.len() + self.matrix_outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (sound objects, matrix inputs, matrix outputs)
    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.sound_objects.len(),
            self.matrix_inputs.len(),
            self.matrix_outputs.len(),
        )
    }

    pub fn live_ids(&self) -> BTreeSet<ProcessorId> {
        self.iter().map(|o| o.id).collect()
    }
}
