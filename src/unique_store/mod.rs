//! Deduplicating, reference counted value storage.
//!
//! A [`UniqueStore`] keeps each distinct value exactly once in a
//! [`DataStore`] and maps values to their [`EntryRef`] through a
//! [`UniqueStoreDictionary`]. Adding a value that is already present bumps its
//! reference count instead of allocating.
//!
//! Freeing is gated twice. When the count of an entry drops to zero the entry
//! leaves the dictionary and its element goes on the element hold list, where
//! it stays readable until every reader that could have seen it is gone. The
//! memory itself is given back only when compaction moves the surviving
//! entries out of the buffer and the retired buffer is trimmed in turn.
//!
//! A store is bound to the [`GenerationHandler`] it is created with. Hold
//! lists are tagged with that handler's current generation and trimmed up to
//! its first used generation, and readers only accept guards it handed out.

mod builder;
mod reader;

pub use builder::UniqueStoreBuilder;
pub use reader::UniqueStoreReader;

use std::sync::atomic::{AtomicU32, Ordering};

use crate::compaction::{CompactionContext, CompactionMap};
use crate::config::BufferTypeConfig;
use crate::datastore::{AddressSpace, BufferIds, BufferStats, DataStore, MemoryUsage};
use crate::dictionary::{ChunkedDictionary, UniqueStoreDictionary};
use crate::entry_ref::EntryRef;
use crate::error::Result;
use crate::generation::{GenerationHandler, GenerationReaders};

/// A stored value with its reference count.
#[derive(Debug)]
pub struct UniqueEntry<T> {
    value: T,
    ref_count: AtomicU32,
}

impl<T> UniqueEntry<T> {
    fn new(value: T, ref_count: u32) -> Self {
        Self {
            value,
            ref_count: AtomicU32::new(ref_count),
        }
    }

    #[inline]
    pub fn value(&self) -> &T {
        &self.value
    }

    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Relaxed)
    }

    // Only the writer changes counts, so a load followed by a store is enough.
    #[inline]
    fn set_ref_count(&self, count: u32) {
        self.ref_count.store(count, Ordering::Relaxed);
    }
}

/// Outcome of [`UniqueStore::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddResult {
    pub entry_ref: EntryRef,
    /// False when the value was already present.
    pub inserted: bool,
}

/// Deduplicating store of `T` values.
pub struct UniqueStore<T, D = ChunkedDictionary<T>> {
    store: DataStore<UniqueEntry<T>>,
    dict: D,
    generations: GenerationReaders,
}

impl<T, D> UniqueStore<T, D>
where
    T: Ord + Clone + Send + Sync,
    D: UniqueStoreDictionary<T> + Default,
{
    pub fn new(config: BufferTypeConfig, handler: &GenerationHandler) -> Result<Self> {
        Self::with_dictionary(config, D::default(), handler)
    }
}

impl<T, D> UniqueStore<T, D>
where
    T: Ord + Clone + Send + Sync,
    D: UniqueStoreDictionary<T>,
{
    /// Create a store on top of an existing (empty) dictionary.
    ///
    /// # Panics
    /// If the dictionary has entries, or if `config` asks for arrays of more
    /// than one element: every entry is a single element.
    pub fn with_dictionary(config: BufferTypeConfig, dict: D, handler: &GenerationHandler) -> Result<Self> {
        assert!(dict.is_empty(), "dictionary must start empty");
        assert_eq!(config.array_size, 1, "unique store entries are single elements");
        Ok(Self {
            store: DataStore::new(config)?,
            dict,
            generations: handler.readers(),
        })
    }

    /// Add a reference to `value`, storing it if it is new.
    pub fn add(&mut self, value: &T) -> Result<AddResult> {
        if let Some(entry_ref) = self.dict.find(value) {
            self.inc_ref_count(entry_ref);
            return Ok(AddResult {
                entry_ref,
                inserted: false,
            });
        }
        let entry_ref = self.store.allocate(UniqueEntry::new(value.clone(), 1))?;
        self.dict.insert(value.clone(), entry_ref);
        Ok(AddResult {
            entry_ref,
            inserted: true,
        })
    }

    /// Drop one reference; the entry is freed when none remain.
    ///
    /// # Panics
    /// If the entry has no references left.
    pub fn remove(&mut self, entry_ref: EntryRef) {
        if self.dec_ref_count(entry_ref) == 0 {
            self.free_entry(entry_ref);
        }
    }

    pub fn find(&self, value: &T) -> Option<EntryRef> {
        self.dict.find(value)
    }

    pub fn get(&self, entry_ref: EntryRef) -> &T {
        self.store.get(entry_ref).value()
    }

    pub fn entry(&self, entry_ref: EntryRef) -> &UniqueEntry<T> {
        self.store.get(entry_ref)
    }

    pub fn ref_count(&self, entry_ref: EntryRef) -> u32 {
        self.store.get(entry_ref).ref_count()
    }

    /// Add a reference without a lookup.
    pub fn inc_ref_count(&mut self, entry_ref: EntryRef) {
        let entry = self.store.get(entry_ref);
        entry.set_ref_count(entry.ref_count() + 1);
    }

    /// Drop a reference without freeing the entry. Returns the new count.
    ///
    /// # Panics
    /// If the entry has no references left.
    pub fn dec_ref_count(&mut self, entry_ref: EntryRef) -> u32 {
        let entry = self.store.get(entry_ref);
        let count = entry.ref_count();
        assert!(count > 0, "{entry_ref:?} has no references left");
        entry.set_ref_count(count - 1);
        count - 1
    }

    pub(crate) fn set_ref_count(&mut self, entry_ref: EntryRef, count: u32) {
        self.store.get(entry_ref).set_ref_count(count);
    }

    fn free_entry(&mut self, entry_ref: EntryRef) {
        let removed = self.dict.remove(self.store.get(entry_ref).value());
        let removed = removed.map(|e| e.entry_ref);
        assert_eq!(removed, Some(entry_ref), "dictionary out of sync with {entry_ref:?}");
        self.store.hold_elem(entry_ref, 1);
    }

    /// Free every entry whose count is zero. Returns how many were freed.
    pub fn free_unused(&mut self) -> usize {
        let unused: Vec<EntryRef> = self
            .dict
            .iter()
            .map(|(_, entry_ref)| entry_ref)
            .filter(|entry_ref| self.store.get(*entry_ref).ref_count() == 0)
            .collect();
        for &entry_ref in &unused {
            self.free_entry(entry_ref);
        }
        unused.len()
    }

    /// Bulk loader for a store without entries.
    pub fn builder(&mut self, size_hint: usize) -> UniqueStoreBuilder<'_, T, D> {
        assert!(self.dict.is_empty(), "builder needs an empty store");
        UniqueStoreBuilder::new(self, size_hint)
    }

    /// Entry refs in ascending value order.
    pub fn enumerate(&self) -> Vec<EntryRef> {
        self.dict.iter().map(|(_, entry_ref)| entry_ref).collect()
    }

    /// Values and refs in ascending value order.
    pub fn iter<'a>(&'a self) -> impl Iterator<Item = (&'a T, EntryRef)> + 'a
    where
        T: 'a,
    {
        self.dict.iter()
    }

    /// A handle for reader threads.
    pub fn reader(&self) -> UniqueStoreReader<T> {
        UniqueStoreReader::new(
            self.store.table(),
            self.dict.frozen_view(),
            self.generations.handler_id(),
        )
    }

    pub fn dictionary(&self) -> &D {
        &self.dict
    }

    /// Keys must stay in step with the store, so only side data may be
    /// changed through this.
    pub(crate) fn dictionary_mut(&mut self) -> &mut D {
        &mut self.dict
    }

    pub fn num_uniques(&self) -> usize {
        self.dict.len()
    }

    pub fn buffer_stats(&self, entry_ref: EntryRef) -> BufferStats {
        self.store.buffer_stats(entry_ref.buffer_id())
    }

    pub fn data_store(&self) -> &DataStore<UniqueEntry<T>> {
        &self.store
    }

    /// Publish the current value order to readers.
    pub fn freeze(&mut self) {
        self.dict.freeze();
    }

    /// Tag everything held since the last call with the handler's current
    /// generation.
    pub fn transfer_hold_lists(&mut self) {
        let generation = self.generations.current_generation();
        self.store.transfer_hold_lists(generation);
        self.dict.transfer_hold_lists(generation);
    }

    /// Release everything no registered reader can still reach.
    pub fn trim_hold_lists(&mut self) {
        let first_used = self.generations.first_used_generation();
        self.store.trim_hold_lists(first_used);
        self.dict.trim_hold_lists(first_used);
    }

    /// Close a mutation boundary: freeze, tag the hold lists, advance the
    /// generation and trim.
    ///
    /// # Panics
    /// If `handler` is not the one the store was created with.
    pub fn commit(&mut self, handler: &mut GenerationHandler) {
        assert_eq!(
            handler.handler_id(),
            self.generations.handler_id(),
            "store is bound to another generation handler"
        );
        self.freeze();
        self.transfer_hold_lists();
        handler.increment_generation();
        self.trim_hold_lists();
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        let mut usage = self.store.memory_usage();
        usage.merge(self.dict.memory_usage());
        usage
    }

    pub fn address_space(&self) -> AddressSpace {
        self.store.address_space()
    }

    /// Compact the buffer with the most dead entries.
    ///
    /// Returns `None` when nothing is dead. The returned context holds the
    /// relocation map; the buffer is retired when the context is finished
    /// or dropped.
    pub fn compact_worst(&mut self) -> Result<Option<CompactionContext<'_, T, D>>> {
        let Some(ids) = self.store.start_compact_worst()? else {
            return Ok(None);
        };
        let map = self.relocate(ids)?;
        Ok(Some(CompactionContext::new(self, map)))
    }

    /// Start compacting every buffer, reserving room for at least
    /// `elems_needed` more elements in the new one.
    pub(crate) fn start_compact(&mut self, elems_needed: usize) -> Result<BufferIds> {
        self.store.set_min_size_needed(elems_needed);
        self.store.start_compact()
    }

    /// Move every live entry out of the buffers being compacted.
    ///
    /// Room for all of them is made before the first one moves. If that
    /// fails the compaction is cancelled and nothing has changed.
    pub(crate) fn relocate(&mut self, buffers: BufferIds) -> Result<CompactionMap> {
        let moving: Vec<EntryRef> = self
            .dict
            .iter()
            .map(|(_, entry_ref)| entry_ref)
            .filter(|entry_ref| self.store.is_compacting(*entry_ref))
            .collect();
        if let Err(err) = self.store.ensure_room(moving.len()) {
            self.store.cancel_compact(&buffers);
            return Err(err);
        }
        let mut map = CompactionMap::new(buffers);
        for old in moving {
            let entry = self.store.get(old);
            let moved = UniqueEntry::new(entry.value().clone(), entry.ref_count());
            // Cannot switch buffers: room was made above.
            let new = self.store.allocate(moved)?;
            self.dict.update_ref(self.store.get(new).value(), new);
            map.insert(old, new);
        }
        tracing::debug!(
            buffers = ?map.compacted_buffers(),
            moved = map.len(),
            "relocated live entries"
        );
        Ok(map)
    }

    /// Retire compacted buffers.
    ///
    /// The dictionary is frozen first so no published snapshot still points
    /// into them once their hold entry is tagged.
    pub(crate) fn finish_compaction(&mut self, buffers: &[u32]) {
        self.dict.freeze();
        self.store.finish_compact(buffers);
    }

    /// Grow the active buffer in place.
    pub fn fallback_resize(&mut self, elems_needed: usize) -> Result<()> {
        self.store.fallback_resize(elems_needed)
    }

    /// Drop every entry and start over with room for `init_elems` entries.
    ///
    /// Values readers borrowed before the reset stay valid until the hold
    /// lists are trimmed past their guards. Refs from before the reset must
    /// not be used afterwards.
    pub fn reset(&mut self, init_elems: usize) -> Result<()> {
        self.store.reset(init_elems)?;
        self.dict.clear();
        Ok(())
    }

    pub(crate) fn allocate_sorted(&mut self, value: T, ref_count: u32) -> Result<EntryRef> {
        self.store.allocate(UniqueEntry::new(value, ref_count))
    }

    pub(crate) fn assign_sorted(&mut self, entries: Vec<(T, EntryRef)>) {
        self.dict.assign_sorted(entries);
    }
}
