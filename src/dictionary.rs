//! Ordered dictionary mapping unique values to their entry refs.
//!
//! The dictionary is private to the writer. Readers that need ordered
//! enumeration use a frozen view: an immutable, ordered snapshot of the refs
//! published by [`UniqueStoreDictionary::freeze`].
//!
//! Entries live in sorted chunks, and each chunk keeps its refs behind an
//! `Arc`. A freeze only collects the chunk pointers, so unchanged chunks are
//! shared between the live dictionary and every snapshot, and a write copies
//! at most one chunk. Publication is a single pointer swap. The superseded
//! snapshot goes through the dictionary's own generation hold list, so a
//! reader keeps seeing the snapshot it started with until it drops its guard.

use std::mem;
use std::ops::Index;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::datastore::MemoryUsage;
use crate::entry_ref::EntryRef;
use crate::generation::{Generation, GenerationGuard, GenerationHoldList};

/// Entries per chunk after a split or a bulk load.
const CHUNK_LEN: usize = 128;

/// Value stored per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DictEntry<D> {
    pub entry_ref: EntryRef,
    /// Side data, e.g. a posting list ref.
    pub data: D,
}

/// Ordered refs as seen at the last freeze.
#[derive(Debug)]
pub struct FrozenRefs {
    chunks: Box<[Arc<Vec<EntryRef>>]>,
    /// Index of the first ref of each chunk.
    starts: Box<[usize]>,
    len: usize,
}

impl FrozenRefs {
    fn empty() -> Self {
        Self {
            chunks: Box::new([]),
            starts: Box::new([]),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> Option<EntryRef> {
        if index >= self.len {
            return None;
        }
        let chunk = self.starts.partition_point(|&start| start <= index) - 1;
        Some(self.chunks[chunk][index - self.starts[chunk]])
    }

    /// Refs in ascending value order.
    pub fn iter(&self) -> impl Iterator<Item = EntryRef> + '_ {
        self.chunks.iter().flat_map(|chunk| chunk.iter().copied())
    }

    pub fn to_vec(&self) -> Vec<EntryRef> {
        self.iter().collect()
    }

    /// Bytes not shared with any other snapshot or the live dictionary.
    fn exclusive_bytes(&self) -> usize {
        let table = self.chunks.len() * (mem::size_of::<Arc<Vec<EntryRef>>>() + mem::size_of::<usize>());
        let owned: usize = self
            .chunks
            .iter()
            .filter(|chunk| Arc::strong_count(chunk) == 1)
            .map(|chunk| chunk.capacity() * mem::size_of::<EntryRef>())
            .sum();
        table + owned
    }
}

impl Index<usize> for FrozenRefs {
    type Output = EntryRef;

    fn index(&self, index: usize) -> &EntryRef {
        assert!(index < self.len, "frozen ref {index} out of bounds for {}", self.len);
        let chunk = self.starts.partition_point(|&start| start <= index) - 1;
        &self.chunks[chunk][index - self.starts[chunk]]
    }
}

#[derive(Debug)]
struct FrozenSlot {
    current: AtomicPtr<FrozenRefs>,
    /// Snapshots still held when their dictionary was dropped.
    orphans: Mutex<Vec<Box<FrozenRefs>>>,
}

impl Drop for FrozenSlot {
    fn drop(&mut self) {
        let current = mem::replace(self.current.get_mut(), ptr::null_mut());
        if !current.is_null() {
            // SAFETY: the pointer came from `Box::into_raw` and nothing else
            // owns it once the slot is gone.
            drop(unsafe { Box::from_raw(current) });
        }
    }
}

/// Reader handle to a dictionary's frozen snapshots.
#[derive(Debug, Clone)]
pub struct FrozenView {
    slot: Arc<FrozenSlot>,
}

impl FrozenView {
    fn new() -> Self {
        Self {
            slot: Arc::new(FrozenSlot {
                current: AtomicPtr::new(Box::into_raw(Box::new(FrozenRefs::empty()))),
                orphans: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Snapshot published at the last freeze.
    ///
    /// The guard must come from the handler driving the dictionary's hold
    /// lists. Every ref in the snapshot then resolves for as long as the
    /// guard lives.
    pub(crate) fn refs<'a>(&'a self, _guard: &'a GenerationGuard) -> &'a FrozenRefs {
        let current = self.slot.current.load(Ordering::Acquire);
        // SAFETY: a superseded snapshot is held until every guard of its
        // retirement generation is gone, and the slot outlives `self`.
        unsafe { &*current }
    }

    /// Make `refs` the current snapshot and hand back the previous one.
    fn publish(&self, refs: FrozenRefs) -> Box<FrozenRefs> {
        let new = Box::into_raw(Box::new(refs));
        let old = self.slot.current.swap(new, Ordering::AcqRel);
        // SAFETY: every published pointer came from `Box::into_raw`, and the
        // swap made this the only owner of `old`.
        unsafe { Box::from_raw(old) }
    }

    fn current(&self) -> &FrozenRefs {
        // SAFETY: only the writer calls this, and it is the one replacing
        // the snapshot.
        unsafe { &*self.slot.current.load(Ordering::Acquire) }
    }

    fn adopt(&self, snapshot: Box<FrozenRefs>) {
        self.slot.orphans.lock().push(snapshot);
    }
}

/// Ordered map from values to entry refs with generation-aware retirement.
///
/// Any ordered associative structure can back it; the store only relies on
/// lookups, in-order iteration and the hold list hooks.
pub trait UniqueStoreDictionary<T>: Send {
    /// Side data stored with each key.
    type Data: Clone + Default + Send + Sync;

    fn find(&self, value: &T) -> Option<EntryRef>;

    /// Insert a value that is not present yet.
    fn insert(&mut self, value: T, entry: EntryRef);

    fn remove(&mut self, value: &T) -> Option<DictEntry<Self::Data>>;

    /// Point an existing key at a relocated entry.
    fn update_ref(&mut self, value: &T, entry: EntryRef);

    /// Replace the whole content with entries given in ascending order.
    fn assign_sorted(&mut self, entries: Vec<(T, EntryRef)>);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries in ascending value order.
    fn iter<'a>(&'a self) -> impl Iterator<Item = (&'a T, EntryRef)> + 'a
    where
        T: 'a;

    fn data(&self, value: &T) -> Option<&Self::Data>;

    /// Set side data for an existing key. Returns false if absent.
    fn set_data(&mut self, value: &T, data: Self::Data) -> bool;

    /// Publish the current ordering to readers.
    fn freeze(&mut self);

    fn frozen_view(&self) -> FrozenView;

    fn transfer_hold_lists(&mut self, generation: Generation);

    fn trim_hold_lists(&mut self, first_used: Generation);

    /// Drop all content. The published snapshot is replaced by an empty one
    /// and retires through the hold list.
    fn clear(&mut self);

    fn memory_usage(&self) -> MemoryUsage;
}

struct Chunk<T, D> {
    keys: Vec<T>,
    data: Vec<D>,
    refs: Arc<Vec<EntryRef>>,
}

impl<T, D> Chunk<T, D> {
    fn last(&self) -> &T {
        &self.keys[self.keys.len() - 1]
    }

    /// Move the upper half into a new chunk.
    fn split(&mut self) -> Self {
        Self {
            keys: self.keys.split_off(CHUNK_LEN),
            data: self.data.split_off(CHUNK_LEN),
            refs: Arc::new(Arc::make_mut(&mut self.refs).split_off(CHUNK_LEN)),
        }
    }
}

/// [`UniqueStoreDictionary`] over sorted copy-on-write chunks.
pub struct ChunkedDictionary<T, D = ()> {
    /// Non-empty chunks in ascending key order.
    chunks: Vec<Chunk<T, D>>,
    len: usize,
    frozen: FrozenView,
    /// Set when the refs changed since the last freeze.
    dirty: bool,
    held_snapshots: GenerationHoldList<Box<FrozenRefs>>,
}

/// Dictionary variant storing a posting list ref per key.
pub type PostingDictionary<T> = ChunkedDictionary<T, EntryRef>;

impl<T: Ord, D> ChunkedDictionary<T, D> {
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            len: 0,
            frozen: FrozenView::new(),
            dirty: false,
            held_snapshots: GenerationHoldList::new(),
        }
    }

    /// Chunk that holds `value` if it is present.
    fn chunk_for(&self, value: &T) -> Option<usize> {
        let index = self.chunks.partition_point(|chunk| chunk.last() < value);
        (index < self.chunks.len()).then_some(index)
    }

    fn position(&self, value: &T) -> Option<(usize, usize)> {
        let chunk = self.chunk_for(value)?;
        let pos = self.chunks[chunk].keys.binary_search(value).ok()?;
        Some((chunk, pos))
    }
}

impl<T: Ord, D> Default for ChunkedDictionary<T, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, D> UniqueStoreDictionary<T> for ChunkedDictionary<T, D>
where
    T: Ord + Send + Sync,
    D: Clone + Default + Send + Sync,
{
    type Data = D;

    fn find(&self, value: &T) -> Option<EntryRef> {
        let (chunk, pos) = self.position(value)?;
        Some(self.chunks[chunk].refs[pos])
    }

    fn insert(&mut self, value: T, entry: EntryRef) {
        self.len += 1;
        self.dirty = true;
        if self.chunks.is_empty() {
            self.chunks.push(Chunk {
                keys: vec![value],
                data: vec![D::default()],
                refs: Arc::new(vec![entry]),
            });
            return;
        }
        let index = self.chunk_for(&value).unwrap_or(self.chunks.len() - 1);
        let chunk = &mut self.chunks[index];
        let pos = match chunk.keys.binary_search(&value) {
            Ok(_) => panic!("value already present in dictionary"),
            Err(pos) => pos,
        };
        chunk.keys.insert(pos, value);
        chunk.data.insert(pos, D::default());
        Arc::make_mut(&mut chunk.refs).insert(pos, entry);
        if chunk.keys.len() > 2 * CHUNK_LEN {
            let upper = chunk.split();
            self.chunks.insert(index + 1, upper);
        }
    }

    fn remove(&mut self, value: &T) -> Option<DictEntry<D>> {
        let (index, pos) = self.position(value)?;
        let chunk = &mut self.chunks[index];
        chunk.keys.remove(pos);
        let data = chunk.data.remove(pos);
        let entry_ref = Arc::make_mut(&mut chunk.refs).remove(pos);
        if chunk.keys.is_empty() {
            self.chunks.remove(index);
        }
        self.len -= 1;
        self.dirty = true;
        Some(DictEntry { entry_ref, data })
    }

    fn update_ref(&mut self, value: &T, entry: EntryRef) {
        let (index, pos) = self
            .position(value)
            .expect("relocated value missing from dictionary");
        Arc::make_mut(&mut self.chunks[index].refs)[pos] = entry;
        self.dirty = true;
    }

    fn assign_sorted(&mut self, entries: Vec<(T, EntryRef)>) {
        debug_assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
        self.len = entries.len();
        self.chunks.clear();
        let mut entries = entries.into_iter().peekable();
        while entries.peek().is_some() {
            let (keys, refs): (Vec<T>, Vec<EntryRef>) = entries.by_ref().take(CHUNK_LEN).unzip();
            self.chunks.push(Chunk {
                data: vec![D::default(); keys.len()],
                keys,
                refs: Arc::new(refs),
            });
        }
        self.dirty = true;
    }

    fn len(&self) -> usize {
        self.len
    }

    fn iter<'a>(&'a self) -> impl Iterator<Item = (&'a T, EntryRef)> + 'a
    where
        T: 'a,
    {
        self.chunks
            .iter()
            .flat_map(|chunk| chunk.keys.iter().zip(chunk.refs.iter().copied()))
    }

    fn data(&self, value: &T) -> Option<&D> {
        let (chunk, pos) = self.position(value)?;
        Some(&self.chunks[chunk].data[pos])
    }

    fn set_data(&mut self, value: &T, data: D) -> bool {
        match self.position(value) {
            Some((chunk, pos)) => {
                self.chunks[chunk].data[pos] = data;
                true
            }
            None => false,
        }
    }

    fn freeze(&mut self) {
        if !mem::take(&mut self.dirty) {
            return;
        }
        let mut start = 0;
        let starts = self
            .chunks
            .iter()
            .map(|chunk| {
                let first = start;
                start += chunk.keys.len();
                first
            })
            .collect();
        let refs = FrozenRefs {
            chunks: self.chunks.iter().map(|chunk| Arc::clone(&chunk.refs)).collect(),
            starts,
            len: self.len,
        };
        let old = self.frozen.publish(refs);
        self.held_snapshots.insert(old);
    }

    fn frozen_view(&self) -> FrozenView {
        self.frozen.clone()
    }

    fn transfer_hold_lists(&mut self, generation: Generation) {
        self.held_snapshots.transfer(generation);
    }

    fn trim_hold_lists(&mut self, first_used: Generation) {
        self.held_snapshots.trim(first_used, |_, snapshot| drop(snapshot));
    }

    fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
        let old = self.frozen.publish(FrozenRefs::empty());
        self.held_snapshots.insert(old);
        self.dirty = false;
    }

    /// Approximate footprint. Chunks shared with snapshots count once.
    fn memory_usage(&self) -> MemoryUsage {
        let entry_bytes = mem::size_of::<T>() + mem::size_of::<D>() + mem::size_of::<EntryRef>();
        let chunk_bytes = mem::size_of::<Chunk<T, D>>();
        let frozen_bytes = self.frozen.current().exclusive_bytes();
        let held_bytes: usize = self.held_snapshots.iter().map(|s| s.exclusive_bytes()).sum();
        let used = self.len * entry_bytes + self.chunks.len() * chunk_bytes + frozen_bytes;
        MemoryUsage {
            allocated_bytes: used + held_bytes,
            used_bytes: used,
            dead_bytes: 0,
            allocated_bytes_on_hold: held_bytes,
        }
    }
}

impl<T, D> Drop for ChunkedDictionary<T, D> {
    fn drop(&mut self) {
        let frozen = &self.frozen;
        self.held_snapshots.clear(|snapshot| frozen.adopt(snapshot));
    }
}
