//! Selection collaborator seam.
//!
//! Which objects are "selected" belongs to the embedding application (its
//! UI, usually). The engine only needs to flip and query selection when the
//! remote side asks, so the surface is a small trait with an in-memory
//! default good enough for the REPL and for tests.

use super::object::ProcessorId;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Selection operations the inbound router relies on.
pub trait SelectionAccess: Send + Sync {
    fn is_selected(&self, id: ProcessorId) -> bool;

    fn set_selected(&self, id: ProcessorId, selected: bool);

    /// Replace the selection with the members of `group`.
    ///
    /// Returns false for unknown groups; that is a silent no-op.
    fn recall_group(&self, group: u16) -> bool;

    fn group_ids(&self) -> Vec<u16>;

    /// Drop all state held for removed objects. Processor ids are recycled,
    /// so a stale entry would otherwise attach to the next object born with
    /// the same id.
    fn forget(&self, ids: &[ProcessorId]);
}

#[derive(Debug, Default)]
struct SelectionState {
    selected: BTreeSet<ProcessorId>,
    groups: BTreeMap<u16, Vec<ProcessorId>>,
}

/// Plain in-process selection store.
#[derive(Debug, Default)]
pub struct InMemorySelection {
    inner: RwLock<SelectionState>,
}

impl InMemorySelection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a named group.
    pub fn define_group(&self, group: u16, members: Vec<ProcessorId>) {
        self.inner.write().groups.insert(group, members);
    }

    pub fn selected_ids(&self) -> Vec<ProcessorId> {
        self.inner.read().selected.iter().copied().collect()
    }
}

impl SelectionAccess for InMemorySelection {
    fn is_selected(&self, id: ProcessorId) -> bool {
        self.inner.read().selected.contains(&id)
    }

    fn set_selected(&self, id: ProcessorId, selected: bool) {
        let mut state = self.inner.write();
        if selected {
            state.selected.insert(id);
        } else {
            state.selected.remove(&id);
        }
    }

    fn recall_group(&self, group: u16) -> bool {
        let mut state = self.inner.write();
        let Some(members) = state.groups.get(&group).cloned() else {
            debug!(group, "selection group not defined, ignoring recall");
            return false;
        };
        state.selected = members.into_iter().collect();
        true
    }

    fn group_ids(&self) -> Vec<u16> {
        self.inner.read().groups.keys().copied().collect()
    }

    fn forget(&self, ids: &[ProcessorId]) {
        let mut state = self.inner.write();
        for id in ids {
            state.selected.remove(id);
        }
        for members in state.groups.values_mut() {
            members.retain(|m| !ids.contains(m));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_and_deselect() {
        let sel = InMemorySelection::new();
        assert!(!sel.is_selected(1));

        sel.set_selected(1, true);
        sel.set_selected(2, true);
        assert!(sel.is_selected(1));
        assert_eq!(sel.selected_ids(), vec![1, 2]);

        sel.set_selected(1, false);
        assert_eq!(sel.selected_ids(), vec![2]);
    }

    #[test]
    fn group_recall_replaces_selection() {
        let sel = InMemorySelection::new();
        sel.define_group(1, vec![3, 4]);
        sel.set_selected(9, true);

        assert!(sel.recall_group(1));
        assert_eq!(sel.selected_ids(), vec![3, 4]);
        assert_eq!(sel.group_ids(), vec![1]);
    }

    #[test]
    fn unknown_group_is_ignored() {
        let sel = InMemorySelection::new();
        sel.set_selected(5, true);

        assert!(!sel.recall_group(42));
        assert_eq!(sel.selected_ids(), vec![5]);
    }

    #[test]
    fn forget_scrubs_selection_and_groups() {
        let sel = InMemorySelection::new();
        sel.define_group(1, vec![1, 2, 3]);
        sel.set_selected(2, true);
        sel.set_selected(3, true);

        sel.forget(&[2]);
        assert_eq!(sel.selected_ids(), vec![3]);
        assert!(sel.recall_group(1));
        assert_eq!(sel.selected_ids(), vec![1, 3]);
    }
}
