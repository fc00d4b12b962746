//! Local element store with selection, clipboard and undo history.
//!
//! The store is the single authoritative copy of a canvas on this device.
//! Local edits and remote actions both go through the same operations.

use crate::clock::now_millis;
use crate::elements::{CanvasElement, ElementId, ElementPatch, new_element_id};
use kurbo::Vec2;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Maximum number of undo states to keep.
pub const MAX_UNDO_HISTORY: usize = 50;

/// Offset applied to pasted elements.
pub const PASTE_OFFSET: Vec2 = Vec2::new(20.0, 20.0);

/// Elements keyed by identifier.
pub type ElementMap = HashMap<ElementId, CanvasElement>;

/// Z-order move for [`ElementStore::reorder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reorder {
    ToFront,
    ToBack,
    Forward,
    Backward,
}

/// In-memory canvas state.
#[derive(Debug, Default)]
pub struct ElementStore {
    elements: ElementMap,
    selection: HashSet<ElementId>,
    /// Full-map snapshots for undo/redo.
    history: Vec<ElementMap>,
    /// Position in `history` of the live state, `None` before the first snapshot.
    history_index: Option<usize>,
    clipboard: Vec<CanvasElement>,
}

impl ElementStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap the store for sharing between the edit path and inbound sync.
    pub fn shared(self) -> SharedStore {
        SharedStore(Arc::new(Mutex::new(self)))
    }

    // --- Elements ---

    /// Insert or overwrite an element.
    ///
    /// Overwriting a tombstoned element keeps it deleted.
    pub fn add(&mut self, mut element: CanvasElement) {
        if let Some(existing) = self.elements.get(&element.id) {
            element.is_deleted |= existing.is_deleted;
        }
        log::debug!("add {} {}", element.kind_name(), element.id);
        self.elements.insert(element.id.clone(), element);
    }

    /// Merge fields into an existing element.
    ///
    /// Returns false, changing nothing, if the id is unknown.
    pub fn update(&mut self, id: &str, patch: impl Into<ElementPatch>) -> bool {
        match self.elements.get_mut(id) {
            Some(element) => {
                patch.into().apply_to(element, now_millis());
                true
            }
            None => {
                log::debug!("update ignored for unknown element {}", id);
                false
            }
        }
    }

    /// Mark an element deleted.
    ///
    /// Returns true only if the element existed and was not already deleted.
    pub fn soft_delete(&mut self, id: &str) -> bool {
        match self.elements.get(id) {
            Some(element) if !element.is_deleted => self.update(id, ElementPatch::tombstone()),
            _ => false,
        }
    }

    /// Mark several elements deleted and drop them from the selection.
    ///
    /// Returns the number of elements newly deleted.
    pub fn soft_delete_many<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) -> usize {
        let mut deleted = 0;
        for id in ids {
            if self.soft_delete(id) {
                deleted += 1;
            }
            self.selection.remove(id);
        }
        deleted
    }

    /// Delete the current selection.
    pub fn delete_selected(&mut self) -> usize {
        let ids: Vec<ElementId> = self.selection.iter().cloned().collect();
        self.soft_delete_many(ids.iter().map(String::as_str))
    }

    /// Get an element by id, including tombstones.
    pub fn get(&self, id: &str) -> Option<&CanvasElement> {
        self.elements.get(id)
    }

    /// All elements, including tombstones, in no particular order.
    pub fn elements(&self) -> &ElementMap {
        &self.elements
    }

    /// Non-deleted elements sorted back to front.
    pub fn visible_ordered(&self) -> Vec<&CanvasElement> {
        let mut visible: Vec<&CanvasElement> = self.elements.values().filter(|e| !e.is_deleted).collect();
        visible.sort_by(|a, b| a.z_index.cmp(&b.z_index).then_with(|| a.id.cmp(&b.id)));
        visible
    }

    /// Owned copies of the non-deleted elements, back to front.
    pub fn visible_elements(&self) -> Vec<CanvasElement> {
        self.visible_ordered().into_iter().cloned().collect()
    }

    /// Number of elements, including tombstones.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Check if the store holds no elements at all.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Replace every element at once.
    ///
    /// Selection entries that no longer exist are dropped.
    pub fn load_bulk(&mut self, elements: impl IntoIterator<Item = CanvasElement>) {
        self.elements = elements.into_iter().map(|e| (e.id.clone(), e)).collect();
        let elements = &self.elements;
        self.selection.retain(|id| elements.contains_key(id));
        log::info!("loaded {} elements", self.elements.len());
    }

    /// Remove all elements and the selection.
    pub fn clear(&mut self) {
        self.elements.clear();
        self.selection.clear();
    }

    // --- Selection ---

    /// Replace the selection with the given known ids.
    pub fn select<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) {
        self.selection = ids
            .into_iter()
            .filter(|id| self.elements.contains_key(*id))
            .map(str::to_string)
            .collect();
    }

    /// Clear the selection.
    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }

    /// Currently selected ids.
    pub fn selection(&self) -> &HashSet<ElementId> {
        &self.selection
    }

    /// Check if an element is selected.
    pub fn is_selected(&self, id: &str) -> bool {
        self.selection.contains(id)
    }

    // --- Z-order ---

    /// Change an element's z-order.
    ///
    /// Only non-deleted elements take part. Returns false if the element is
    /// absent or deleted, or if there is no neighbor to swap with.
    pub fn reorder(&mut self, id: &str, to: Reorder) -> bool {
        let current = match self.elements.get(id) {
            Some(element) if !element.is_deleted => element.z_index,
            _ => return false,
        };
        let live = || self.elements.values().filter(|e| !e.is_deleted);

        match to {
            Reorder::ToFront => {
                let top = live().map(|e| e.z_index).max().unwrap_or(current);
                self.update(id, ElementPatch::z_index(top + 1))
            }
            Reorder::ToBack => {
                let bottom = live().map(|e| e.z_index).min().unwrap_or(current);
                self.update(id, ElementPatch::z_index(bottom - 1))
            }
            Reorder::Forward => {
                let above = live()
                    .filter(|e| e.id != id && e.z_index > current)
                    .min_by_key(|e| e.z_index)
                    .map(|e| (e.id.clone(), e.z_index));
                self.swap_z(id, current, above)
            }
            Reorder::Backward => {
                let below = live()
                    .filter(|e| e.id != id && e.z_index < current)
                    .max_by_key(|e| e.z_index)
                    .map(|e| (e.id.clone(), e.z_index));
                self.swap_z(id, current, below)
            }
        }
    }

    fn swap_z(&mut self, id: &str, current: i64, neighbor: Option<(ElementId, i64)>) -> bool {
        let Some((neighbor_id, neighbor_z)) = neighbor else {
            return false;
        };
        self.update(id, ElementPatch::z_index(neighbor_z));
        self.update(&neighbor_id, ElementPatch::z_index(current));
        true
    }

    // --- Clipboard ---

    /// Copy the given elements to the clipboard.
    ///
    /// Returns the number copied. The clipboard is left alone if none of the
    /// ids are known.
    pub fn copy<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) -> usize {
        let copied: Vec<CanvasElement> = ids
            .into_iter()
            .filter_map(|id| self.elements.get(id).cloned())
            .collect();
        if copied.is_empty() {
            return 0;
        }
        self.clipboard = copied;
        self.clipboard.len()
    }

    /// Copy the given elements, then delete them and clear the selection.
    pub fn cut<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) -> usize {
        let ids: Vec<&str> = ids.into_iter().collect();
        let copied = self.copy(ids.iter().copied());
        if copied > 0 {
            for id in &ids {
                self.soft_delete(id);
            }
            self.selection.clear();
        }
        copied
    }

    /// Insert fresh copies of the clipboard contents and select them.
    ///
    /// Every pasted element gets a new id, an offset position, fresh
    /// timestamps and z-order, and is never deleted.
    pub fn paste(&mut self) -> Vec<ElementId> {
        if self.clipboard.is_empty() {
            log::debug!("Nothing to paste");
            return Vec::new();
        }

        let now = now_millis();
        let pasted: Vec<CanvasElement> = self
            .clipboard
            .iter()
            .enumerate()
            .map(|(i, source)| {
                let mut element = source.clone();
                element.id = new_element_id();
                element.translate(PASTE_OFFSET);
                element.z_index = now + i as i64;
                element.created_at = now;
                element.updated_at = now;
                element.is_deleted = false;
                element
            })
            .collect();

        let ids: Vec<ElementId> = pasted.iter().map(|e| e.id.clone()).collect();
        for element in pasted {
            self.elements.insert(element.id.clone(), element);
        }
        self.selection = ids.iter().cloned().collect();
        ids
    }

    /// Number of elements waiting on the clipboard.
    pub fn clipboard_len(&self) -> usize {
        self.clipboard.len()
    }

    // --- History ---

    /// Record the current state as an undo point.
    ///
    /// Call once a gesture has finished. Any redo states are discarded.
    pub fn snapshot_for_undo(&mut self) {
        let keep = self.history_index.map_or(0, |i| i + 1);
        self.history.truncate(keep);
        self.history.push(self.elements.clone());

        if self.history.len() > MAX_UNDO_HISTORY {
            self.history.remove(0);
        }
        self.history_index = Some(self.history.len() - 1);
    }

    /// Step back one snapshot.
    /// Returns true if undo was performed, false if nothing to undo.
    pub fn undo(&mut self) -> bool {
        match self.history_index {
            Some(index) if index > 0 => {
                self.history_index = Some(index - 1);
                self.elements = self.history[index - 1].clone();
                true
            }
            _ => {
                log::debug!("Nothing to undo");
                false
            }
        }
    }

    /// Step forward one snapshot.
    /// Returns true if redo was performed, false if nothing to redo.
    pub fn redo(&mut self) -> bool {
        match self.history_index {
            Some(index) if index + 1 < self.history.len() => {
                self.history_index = Some(index + 1);
                self.elements = self.history[index + 1].clone();
                true
            }
            _ => {
                log::debug!("Nothing to redo");
                false
            }
        }
    }

    /// Check if undo is available.
    pub fn can_undo(&self) -> bool {
        matches!(self.history_index, Some(index) if index > 0)
    }

    /// Check if redo is available.
    pub fn can_redo(&self) -> bool {
        matches!(self.history_index, Some(index) if index + 1 < self.history.len())
    }

    /// Number of recorded snapshots.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

/// Cloneable handle to a store shared by the edit path and inbound sync.
///
/// The lock is never held across an await point.
#[derive(Debug, Clone, Default)]
pub struct SharedStore(Arc<Mutex<ElementStore>>);

impl SharedStore {
    pub fn new() -> Self {
        ElementStore::new().shared()
    }

    /// Lock the store. A poisoned lock is recovered since every store
    /// operation leaves the map consistent.
    pub fn lock(&self) -> MutexGuard<'_, ElementStore> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run a closure against the locked store.
    pub fn with<R>(&self, f: impl FnOnce(&mut ElementStore) -> R) -> R {
        f(&mut self.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ME: &str = "me";

    fn rect(z: i64) -> CanvasElement {
        let mut element = CanvasElement::rectangle(0.0, 0.0, 10.0, 10.0, ME);
        element.z_index = z;
        element
    }

    fn store_with(elements: &[CanvasElement]) -> ElementStore {
        let mut store = ElementStore::new();
        for element in elements {
            store.add(element.clone());
        }
        store
    }

    #[test]
    fn test_add_twice_overwrites() {
        let element = rect(1);
        let mut store = store_with(&[element.clone()]);
        store.add(element.clone());

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&element.id), Some(&element));
    }

    #[test]
    fn test_add_keeps_tombstone() {
        let element = rect(1);
        let mut store = store_with(&[element.clone()]);
        assert!(store.soft_delete(&element.id));

        store.add(element.clone());
        assert!(store.get(&element.id).unwrap().is_deleted);
    }

    #[test]
    fn test_update_unknown_is_noop() {
        let mut store = ElementStore::new();
        assert!(!store.update("missing", ElementPatch::position(1.0, 1.0)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_update_refreshes_timestamp() {
        let mut element = rect(1);
        element.updated_at = 0;
        let mut store = store_with(&[element.clone()]);

        assert!(store.update(&element.id, ElementPatch::position(5.0, 6.0)));
        let updated = store.get(&element.id).unwrap();
        assert_eq!((updated.x, updated.y), (5.0, 6.0));
        assert!(updated.updated_at > 0);
        assert_eq!(updated.id, element.id);
    }

    #[test]
    fn test_soft_delete_twice() {
        let element = rect(1);
        let mut store = store_with(&[element.clone()]);

        assert!(store.soft_delete(&element.id));
        assert!(!store.soft_delete(&element.id));
        assert!(store.get(&element.id).unwrap().is_deleted);
        assert!(store.visible_ordered().is_empty());
    }

    #[test]
    fn test_operations_applied_twice_are_idempotent() {
        let a = rect(1);
        let b = rect(2);
        let mut moved = b.clone();
        moved.x = 42.0;

        let apply = |store: &mut ElementStore, times: usize| {
            for _ in 0..times {
                store.add(a.clone());
                store.add(b.clone());
            }
            for _ in 0..times {
                store.update(&b.id, moved.clone());
            }
            for _ in 0..times {
                store.soft_delete(&a.id);
            }
        };
        let mut once = ElementStore::new();
        let mut twice = ElementStore::new();
        apply(&mut once, 1);
        apply(&mut twice, 2);

        let strip = |store: &ElementStore| {
            let mut v: Vec<CanvasElement> = store
                .elements()
                .values()
                .cloned()
                .map(|mut e| {
                    e.updated_at = 0;
                    e
                })
                .collect();
            v.sort_by(|x, y| x.id.cmp(&y.id));
            v
        };
        assert_eq!(strip(&once), strip(&twice));
    }

    #[test]
    fn test_delete_selected_clears_selection() {
        let a = rect(1);
        let b = rect(2);
        let mut store = store_with(&[a.clone(), b.clone()]);

        store.select([a.id.as_str(), b.id.as_str(), "ghost"]);
        assert_eq!(store.selection().len(), 2);

        assert_eq!(store.delete_selected(), 2);
        assert!(store.selection().is_empty());
        assert!(store.visible_ordered().is_empty());
    }

    #[test]
    fn test_reorder_front_and_back() {
        let a = rect(1);
        let b = rect(2);
        let c = rect(3);
        let mut store = store_with(&[a.clone(), b.clone(), c.clone()]);

        assert!(store.reorder(&a.id, Reorder::ToFront));
        assert_eq!(store.get(&a.id).unwrap().z_index, 4);

        assert!(store.reorder(&c.id, Reorder::ToBack));
        assert_eq!(store.get(&c.id).unwrap().z_index, 1);

        let order: Vec<&str> = store.visible_ordered().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(order, vec![c.id.as_str(), b.id.as_str(), a.id.as_str()]);
    }

    #[test]
    fn test_to_front_twice_keeps_relative_order() {
        let a = rect(1);
        let b = rect(2);
        let mut store = store_with(&[a.clone(), b.clone()]);

        store.reorder(&a.id, Reorder::ToFront);
        let first: Vec<String> = store.visible_ordered().iter().map(|e| e.id.clone()).collect();
        store.reorder(&a.id, Reorder::ToFront);
        let second: Vec<String> = store.visible_ordered().iter().map(|e| e.id.clone()).collect();

        assert_eq!(first, second);
    }

    #[test]
    fn test_forward_and_backward_swap_neighbors() {
        let a = rect(10);
        let b = rect(20);
        let hidden = rect(15);
        let mut store = store_with(&[a.clone(), b.clone(), hidden.clone()]);
        store.soft_delete(&hidden.id);

        assert!(store.reorder(&a.id, Reorder::Forward));
        assert_eq!(store.get(&a.id).unwrap().z_index, 20);
        assert_eq!(store.get(&b.id).unwrap().z_index, 10);
        assert_eq!(store.get(&hidden.id).unwrap().z_index, 15);

        assert!(!store.reorder(&a.id, Reorder::Forward));
        assert!(store.reorder(&a.id, Reorder::Backward));
        assert!(!store.reorder(&a.id, Reorder::Backward));
    }

    #[test]
    fn test_reorder_deleted_is_noop() {
        let a = rect(1);
        let mut store = store_with(&[a.clone()]);
        store.soft_delete(&a.id);
        assert!(!store.reorder(&a.id, Reorder::ToFront));
        assert!(!store.reorder("missing", Reorder::ToBack));
    }

    #[test]
    fn test_copy_paste_produces_distinct_ids() {
        let a = rect(1);
        let mut store = store_with(&[a.clone()]);
        assert_eq!(store.copy([a.id.as_str()]), 1);

        let mut seen = HashSet::new();
        for _ in 0..3 {
            let pasted = store.paste();
            assert_eq!(pasted.len(), 1);
            assert_ne!(pasted[0], a.id);
            assert!(seen.insert(pasted[0].clone()));
            assert!(store.is_selected(&pasted[0]));
        }
        assert_eq!(store.len(), 4);

        let copy = store.get(seen.iter().next().unwrap()).unwrap();
        assert_eq!((copy.x, copy.y), (20.0, 20.0));
    }

    #[test]
    fn test_cut_then_paste_revives_copy() {
        let a = rect(1);
        let mut store = store_with(&[a.clone()]);
        store.select([a.id.as_str()]);

        assert_eq!(store.cut([a.id.as_str()]), 1);
        assert!(store.get(&a.id).unwrap().is_deleted);
        assert!(store.selection().is_empty());

        let pasted = store.paste();
        assert!(!store.get(&pasted[0]).unwrap().is_deleted);
        assert!(store.get(&a.id).unwrap().is_deleted);
    }

    #[test]
    fn test_paste_empty_clipboard() {
        let mut store = ElementStore::new();
        assert!(store.paste().is_empty());
        assert_eq!(store.copy(["missing"]), 0);
        assert_eq!(store.clipboard_len(), 0);
    }

    #[test]
    fn test_undo_restores_previous_snapshot() {
        let a = rect(1);
        let mut store = ElementStore::new();
        store.snapshot_for_undo();

        store.add(a.clone());
        store.snapshot_for_undo();
        let before_last = store.elements().clone();

        store.soft_delete(&a.id);
        store.snapshot_for_undo();

        assert!(store.undo());
        assert_eq!(store.elements(), &before_last);
        assert!(!store.get(&a.id).unwrap().is_deleted);

        assert!(store.redo());
        assert!(store.get(&a.id).unwrap().is_deleted);
        assert!(!store.redo());
    }

    #[test]
    fn test_undo_at_boundaries() {
        let mut store = ElementStore::new();
        assert!(!store.undo());
        assert!(!store.redo());

        store.snapshot_for_undo();
        assert!(!store.can_undo());
        assert!(!store.undo());
    }

    #[test]
    fn test_snapshot_truncates_redo() {
        let mut store = ElementStore::new();
        store.snapshot_for_undo();
        store.add(rect(1));
        store.snapshot_for_undo();

        assert!(store.undo());
        assert!(store.can_redo());

        store.add(rect(2));
        store.snapshot_for_undo();
        assert!(!store.can_redo());
        assert_eq!(store.history_len(), 2);
    }

    #[test]
    fn test_history_is_capped() {
        let mut store = ElementStore::new();
        for z in 0..(MAX_UNDO_HISTORY as i64 + 10) {
            store.add(rect(z));
            store.snapshot_for_undo();
        }
        assert_eq!(store.history_len(), MAX_UNDO_HISTORY);

        let mut steps = 0;
        while store.undo() {
            steps += 1;
        }
        assert_eq!(steps, MAX_UNDO_HISTORY - 1);
    }

    #[test]
    fn test_load_bulk_replaces_everything() {
        let a = rect(1);
        let b = rect(2);
        let mut store = store_with(&[a.clone()]);
        store.select([a.id.as_str()]);

        store.load_bulk(vec![b.clone()]);
        assert_eq!(store.len(), 1);
        assert!(store.get(&a.id).is_none());
        assert!(store.selection().is_empty());

        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_shared_store_handle() {
        let shared = SharedStore::new();
        let other = shared.clone();
        shared.with(|store| store.add(rect(1)));
        assert_eq!(other.lock().len(), 1);
    }
}
