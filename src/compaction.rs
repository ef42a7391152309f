//! Relocation maps handed to callers during compaction.
//!
//! Compaction copies every live entry out of the buffers being compacted and
//! records where each one went. Callers that keep entry refs of their own
//! (posting lists, sort orders) must translate them before the compaction is
//! finished; once the old buffers are retired and trimmed, untranslated refs
//! point at released memory.

use std::collections::HashMap;

use crate::datastore::BufferIds;
use crate::dictionary::UniqueStoreDictionary;
use crate::entry_ref::EntryRef;
use crate::unique_store::UniqueStore;

/// Old ref to new ref for one compaction.
#[derive(Debug, Clone, Default)]
pub struct CompactionMap {
    buffers: BufferIds,
    moves: HashMap<EntryRef, EntryRef>,
}

impl CompactionMap {
    pub(crate) fn new(buffers: BufferIds) -> Self {
        Self {
            buffers,
            moves: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, old: EntryRef, new: EntryRef) {
        let previous = self.moves.insert(old, new);
        debug_assert!(previous.is_none(), "{old:?} relocated twice");
    }

    /// Buffers whose entries moved.
    pub fn compacted_buffers(&self) -> &[u32] {
        &self.buffers
    }

    /// True if `entry_ref` lives in a buffer being compacted.
    pub fn is_compacted(&self, entry_ref: EntryRef) -> bool {
        entry_ref.is_valid() && self.buffers.contains(&entry_ref.buffer_id())
    }

    /// Where `entry_ref` lives after compaction.
    ///
    /// Refs outside the compacted buffers, and the invalid ref, are returned
    /// unchanged.
    ///
    /// # Panics
    /// If `entry_ref` is in a compacted buffer but was not live when the
    /// compaction started.
    pub fn translate(&self, entry_ref: EntryRef) -> EntryRef {
        if !self.is_compacted(entry_ref) {
            return entry_ref;
        }
        match self.moves.get(&entry_ref) {
            Some(&moved) => moved,
            None => panic!("stale {entry_ref:?} has no relocation"),
        }
    }

    /// Translate a slice of refs in place. Returns how many changed.
    pub fn translate_in_place(&self, refs: &mut [EntryRef]) -> usize {
        let mut changed = 0;
        for entry_ref in refs {
            let moved = self.translate(*entry_ref);
            if moved != *entry_ref {
                *entry_ref = moved;
                changed += 1;
            }
        }
        changed
    }

    /// Number of relocated entries.
    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// `(old, new)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (EntryRef, EntryRef)> + '_ {
        self.moves.iter().map(|(&old, &new)| (old, new))
    }
}

/// An in-progress compaction of a [`UniqueStore`].
///
/// Live entries have already moved and the dictionary points at the new
/// locations. The old buffers stay readable until the context is finished
/// (or dropped), which hands them to the buffer hold list.
pub struct CompactionContext<'a, T, D>
where
    T: Ord + Clone + Send + Sync,
    D: UniqueStoreDictionary<T>,
{
    store: &'a mut UniqueStore<T, D>,
    map: CompactionMap,
}

impl<'a, T, D> CompactionContext<'a, T, D>
where
    T: Ord + Clone + Send + Sync,
    D: UniqueStoreDictionary<T>,
{
    pub(crate) fn new(store: &'a mut UniqueStore<T, D>, map: CompactionMap) -> Self {
        Self { store, map }
    }

    pub fn map(&self) -> &CompactionMap {
        &self.map
    }

    /// Translate externally held refs.
    pub fn compact(&self, refs: &mut [EntryRef]) -> usize {
        self.map.translate_in_place(refs)
    }

    pub fn translate(&self, entry_ref: EntryRef) -> EntryRef {
        self.map.translate(entry_ref)
    }

    /// The store being compacted, for reading moved entries.
    pub fn store(&self) -> &UniqueStore<T, D> {
        &*self.store
    }

    /// Retire the compacted buffers.
    pub fn finish(self) {}
}

impl<T, D> Drop for CompactionContext<'_, T, D>
where
    T: Ord + Clone + Send + Sync,
    D: UniqueStoreDictionary<T>,
{
    fn drop(&mut self) {
        self.store.finish_compaction(&self.map.buffers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> CompactionMap {
        let mut map = CompactionMap::new(BufferIds::from_slice(&[2]));
        map.insert(EntryRef::new(2, 5), EntryRef::new(7, 1));
        map.insert(EntryRef::new(2, 9), EntryRef::new(7, 2));
        map
    }

    #[test]
    fn test_translate() {
        let map = map();
        assert_eq!(map.translate(EntryRef::new(2, 5)), EntryRef::new(7, 1));
        assert_eq!(map.translate(EntryRef::new(3, 5)), EntryRef::new(3, 5));
        assert_eq!(map.translate(EntryRef::INVALID), EntryRef::INVALID);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_translate_in_place() {
        let map = map();
        let mut refs = [EntryRef::new(2, 9), EntryRef::INVALID, EntryRef::new(1, 1)];
        assert_eq!(map.translate_in_place(&mut refs), 1);
        assert_eq!(refs, [EntryRef::new(7, 2), EntryRef::INVALID, EntryRef::new(1, 1)]);
    }

    #[test]
    #[should_panic(expected = "no relocation")]
    fn test_stale_ref_panics() {
        map().translate(EntryRef::new(2, 6));
    }
}
