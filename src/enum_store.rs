//! Enum store: the value dictionary behind an enumerated attribute.
//!
//! An [`EnumStore`] wraps a [`UniqueStore`] with what an attribute needs on
//! top of plain deduplication: loading from a serialized record stream with a
//! reference count fix-up afterwards, compaction driven in three steps so the
//! caller can translate its own refs in between, and address space figures
//! for back-pressure.
//!
//! # Example
//!
//! ```rust
//! use genstore::{BufferTypeConfig, EnumStore, GenerationHandler};
//!
//! let mut handler = GenerationHandler::new();
//! let mut store: EnumStore<String> = EnumStore::new(0, BufferTypeConfig::default(), &handler).unwrap();
//!
//! let foo = store.add(&"foo".to_string()).unwrap().entry_ref;
//! store.add(&"foo".to_string()).unwrap();
//! assert_eq!(store.ref_count(foo), 2);
//!
//! store.remove(foo);
//! store.remove(foo);
//! assert_eq!(store.find(&"foo".to_string()), None);
//!
//! // Mutation boundary: publish, tag, advance, reclaim.
//! store.commit(&mut handler);
//! assert!(store.memory_usage().allocated_bytes_on_hold == 0);
//! ```

use crate::compaction::{CompactionContext, CompactionMap};
use crate::config::BufferTypeConfig;
use crate::datastore::{AddressSpace, BufferIds, MemoryUsage};
use crate::dictionary::{ChunkedDictionary, PostingDictionary, UniqueStoreDictionary};
use crate::encoding::{Decoder, EnumValue};
use crate::entry_ref::EntryRef;
use crate::error::{Result, StoreError};
use crate::generation::GenerationHandler;
use crate::unique_store::{AddResult, UniqueStore, UniqueStoreReader};

/// Deduplicated, reference counted values of an attribute.
pub struct EnumStore<T, D = ChunkedDictionary<T>> {
    unique: UniqueStore<T, D>,
    /// Buffers between `pre_compact` and `post_compact`.
    compacting: Option<BufferIds>,
}

impl<T: EnumValue> EnumStore<T> {
    /// Create a store whose first buffer holds at least `init_elems` entries.
    pub fn new(init_elems: usize, config: BufferTypeConfig, handler: &GenerationHandler) -> Result<Self> {
        Self::with_dictionary(init_elems, config, ChunkedDictionary::new(), handler)
    }
}

impl<T: EnumValue> EnumStore<T, PostingDictionary<T>> {
    /// Create a store that keeps a posting list ref per value.
    pub fn with_postings(init_elems: usize, config: BufferTypeConfig, handler: &GenerationHandler) -> Result<Self> {
        Self::with_dictionary(init_elems, config, PostingDictionary::new(), handler)
    }

    /// Posting list of the value at `entry_ref`, invalid if none was set.
    pub fn posting_list(&self, entry_ref: EntryRef) -> EntryRef {
        self.unique
            .dictionary()
            .data(self.get(entry_ref))
            .copied()
            .unwrap_or(EntryRef::INVALID)
    }

    /// Attach a posting list to the live value at `entry_ref`.
    pub fn set_posting_list(&mut self, entry_ref: EntryRef, posting: EntryRef) {
        let value = self.get(entry_ref).clone();
        let found = self.unique.dictionary_mut().set_data(&value, posting);
        assert!(found, "{entry_ref:?} is not in the dictionary");
    }
}

impl<T, D> EnumStore<T, D>
where
    T: EnumValue,
    D: UniqueStoreDictionary<T>,
{
    /// # Panics
    /// If `config` asks for arrays of more than one element.
    pub fn with_dictionary(
        init_elems: usize,
        config: BufferTypeConfig,
        dict: D,
        handler: &GenerationHandler,
    ) -> Result<Self> {
        assert_eq!(config.array_size, 1, "enum store values are single elements");
        let arrays = init_elems.max(config.num_arrays_for_new_buffer);
        let config = config.with_initial_arrays(arrays);
        Ok(Self {
            unique: UniqueStore::with_dictionary(config, dict, handler)?,
            compacting: None,
        })
    }

    pub fn add(&mut self, value: &T) -> Result<AddResult> {
        self.unique.add(value)
    }

    /// Drop one reference, freeing the value when none remain.
    pub fn remove(&mut self, entry_ref: EntryRef) {
        self.unique.remove(entry_ref);
    }

    pub fn find(&self, value: &T) -> Option<EntryRef> {
        self.unique.find(value)
    }

    pub fn get(&self, entry_ref: EntryRef) -> &T {
        self.unique.get(entry_ref)
    }

    pub fn ref_count(&self, entry_ref: EntryRef) -> u32 {
        self.unique.ref_count(entry_ref)
    }

    pub fn inc_ref_count(&mut self, entry_ref: EntryRef) {
        self.unique.inc_ref_count(entry_ref);
    }

    /// Drop a reference but keep the value even at zero.
    ///
    /// Values left at zero are freed by [`free_unused_enums`](Self::free_unused_enums).
    pub fn dec_ref_count(&mut self, entry_ref: EntryRef) {
        self.unique.dec_ref_count(entry_ref);
    }

    /// Free every value with no references. Returns how many were freed.
    pub fn free_unused_enums(&mut self) -> usize {
        let freed = self.unique.free_unused();
        if freed > 0 {
            tracing::debug!(freed, "freed unused enum values");
        }
        freed
    }

    pub fn num_uniques(&self) -> usize {
        self.unique.num_uniques()
    }

    /// Refs in ascending value order.
    pub fn enumerate(&self) -> Vec<EntryRef> {
        self.unique.enumerate()
    }

    pub fn unique_store(&self) -> &UniqueStore<T, D> {
        &self.unique
    }

    pub fn reader(&self) -> UniqueStoreReader<T> {
        self.unique.reader()
    }

    /// Replace the content with values read from `bytes`.
    ///
    /// The records are parsed twice: once to validate them and size the
    /// store, then again to build it. Every value starts with a reference
    /// count of zero; [`fixup_ref_counts`](Self::fixup_ref_counts) sets the
    /// real counts. Returns the new refs in record order.
    ///
    /// Records must be strictly ascending. Corrupt input leaves the store
    /// unchanged. Refs from before the call must not be used afterwards;
    /// values readers borrowed stay valid until the next trim past their
    /// guards.
    pub fn deserialize(&mut self, bytes: &[u8]) -> Result<Vec<EntryRef>> {
        let count = count_records::<T>(bytes)?;
        self.reset(count)?;

        let mut decoder = Decoder::new(bytes);
        let mut refs = Vec::with_capacity(count);
        let mut builder = self.unique.builder(count);
        while !decoder.is_empty() {
            let value = T::decode(&mut decoder)?;
            refs.push(builder.add(value, 0)?);
        }
        builder.finish();
        tracing::debug!(entries = count, bytes = bytes.len(), "deserialized enum store");
        Ok(refs)
    }

    /// Values in ascending order, in the format [`deserialize`](Self::deserialize) reads.
    pub fn serialize(&self) -> Vec<u8> {
        let len = self.unique.iter().map(|(value, _)| value.encoded_len()).sum();
        let mut buf = Vec::with_capacity(len);
        for (value, _) in self.unique.iter() {
            value.encode(&mut buf);
        }
        buf
    }

    /// Set reference counts from a histogram in value order, then free the
    /// values nothing refers to.
    ///
    /// An empty histogram means no counts were collected: nothing changes.
    ///
    /// # Panics
    /// If a non-empty histogram's length differs from the number of values.
    /// The counts would be attributed to the wrong values otherwise.
    pub fn fixup_ref_counts(&mut self, hist: &[u32]) {
        if hist.is_empty() {
            return;
        }
        let refs = self.unique.enumerate();
        assert_eq!(
            refs.len(),
            hist.len(),
            "ref count histogram does not match the number of values"
        );
        for (&entry_ref, &count) in refs.iter().zip(hist) {
            self.unique.set_ref_count(entry_ref, count);
        }
        self.free_unused_enums();
    }

    /// Start compacting every buffer.
    ///
    /// The new active buffer has room for the live entries plus
    /// `elems_needed`. Returns false, changing nothing, when no buffer id is
    /// free to compact into.
    pub fn pre_compact(&mut self, elems_needed: usize) -> Result<bool> {
        assert!(self.compacting.is_none(), "compaction already in progress");
        if self.unique.data_store().num_free_buffers() == 0 {
            tracing::debug!("no free buffer to compact into");
            return Ok(false);
        }
        self.compacting = Some(self.unique.start_compact(elems_needed)?);
        Ok(true)
    }

    /// Move live entries out of the buffers `pre_compact` selected.
    ///
    /// The caller translates its refs through the returned map before
    /// calling [`post_compact`](Self::post_compact).
    pub fn perform_compaction(&mut self) -> Result<CompactionMap> {
        let Some(buffers) = self.compacting.clone() else {
            panic!("perform_compaction called without pre_compact");
        };
        let map = self.unique.relocate(buffers);
        if map.is_err() {
            self.compacting = None;
        }
        map
    }

    /// Retire the compacted buffers onto the hold list.
    pub fn post_compact(&mut self) {
        let Some(buffers) = self.compacting.take() else {
            panic!("post_compact called without pre_compact");
        };
        self.unique.finish_compaction(&buffers);
    }

    /// Compact the buffer with the most dead entries, if any has some.
    pub fn compact_worst(&mut self) -> Result<Option<CompactionContext<'_, T, D>>> {
        assert!(self.compacting.is_none(), "compaction already in progress");
        self.unique.compact_worst()
    }

    /// Emergency growth of the active buffer; flags it for compaction.
    pub fn fallback_resize(&mut self, elems_needed: usize) -> Result<()> {
        self.unique.fallback_resize(elems_needed)
    }

    pub fn address_space_usage(&self) -> AddressSpace {
        self.unique.address_space()
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        self.unique.memory_usage()
    }

    pub fn freeze(&mut self) {
        self.unique.freeze();
    }

    pub fn transfer_hold_lists(&mut self) {
        self.unique.transfer_hold_lists();
    }

    pub fn trim_hold_lists(&mut self) {
        self.unique.trim_hold_lists();
    }

    /// Close a mutation boundary on the store's generation handler.
    pub fn commit(&mut self, handler: &mut GenerationHandler) {
        self.unique.commit(handler);
    }

    /// Drop every value and start over.
    ///
    /// A compaction in progress is abandoned. Refs from before the reset
    /// must not be used afterwards.
    pub fn reset(&mut self, init_elems: usize) -> Result<()> {
        self.unique.reset(init_elems)?;
        self.compacting = None;
        Ok(())
    }
}

/// Validate a record stream and count its records.
fn count_records<T: EnumValue>(bytes: &[u8]) -> Result<usize> {
    let mut decoder = Decoder::new(bytes);
    let mut previous: Option<T> = None;
    let mut count = 0;
    while !decoder.is_empty() {
        let offset = decoder.position();
        let value = T::decode(&mut decoder)?;
        if previous.as_ref().is_some_and(|p| *p >= value) {
            return Err(StoreError::Corrupt {
                offset,
                reason: "records are not strictly ascending",
            });
        }
        previous = Some(value);
        count += 1;
    }
    Ok(count)
}
