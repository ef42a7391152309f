//! Buffer arena with generation-held reclamation.
//!
//! A [`DataStore`] owns up to `max_buffers` buffers of one element type.
//! Allocation bumps a pointer in the active buffer; when the buffer is full a
//! new one is chosen from the free buffer ids and sized by the growth policy.
//! Freed elements are only accounted as dead once their hold list entry is
//! trimmed, and their memory is only given back when the whole buffer is
//! compacted away and retired through the buffer hold list.
//!
//! Buffer creation and release are the only points that touch the global
//! allocator. Everything else is index arithmetic.
//!
//! Nothing is dropped while a reader could still reach it: replaced
//! allocations, retired buffers and the buffers discarded by a reset all go
//! through the buffer hold list. Whatever is still held when the store is
//! dropped is handed to the shared buffer table.

mod buffer;
mod growth;

pub use buffer::{BufferStats, BufferStatus};

pub(crate) use buffer::BufferTable;

use std::mem;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::config::BufferTypeConfig;
use crate::entry_ref::EntryRef;
use crate::error::{Result, StoreError};
use crate::generation::{Generation, GenerationHoldList};

use buffer::{BufferState, Segment};
use growth::GrowthInput;

/// Buffer ids taking part in a compaction.
pub type BufferIds = SmallVec<[u32; 4]>;

/// Memory accounting for a store, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Bytes allocated for buffers, held ones included.
    pub allocated_bytes: usize,
    /// Bytes handed out, reserved elements included.
    pub used_bytes: usize,
    /// Bytes known to be unreachable (reserved elements included).
    pub dead_bytes: usize,
    /// Bytes waiting on a hold list.
    pub allocated_bytes_on_hold: usize,
}

impl MemoryUsage {
    /// Add another component's usage.
    pub fn merge(&mut self, other: MemoryUsage) {
        self.allocated_bytes += other.allocated_bytes;
        self.used_bytes += other.used_bytes;
        self.dead_bytes += other.dead_bytes;
        self.allocated_bytes_on_hold += other.allocated_bytes_on_hold;
    }
}

/// Address space consumption, in elements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressSpace {
    /// Elements handed out in buffers that are not free.
    pub used: usize,
    /// Elements of `used` that can never be read again.
    pub dead: usize,
    /// Elements addressable by every buffer id together.
    pub limit: usize,
}

#[derive(Debug, Clone, Copy)]
struct ElemHold {
    entry: EntryRef,
    size: usize,
}

enum HeldBuffer<E> {
    /// A whole buffer id retired by compaction.
    Buffer(u32),
    /// An allocation superseded by a fallback resize or discarded by a reset.
    Allocation(Box<Segment<E>>),
}

/// Bump allocator over a set of fixed-capacity buffers.
pub struct DataStore<E> {
    config: BufferTypeConfig,
    table: Arc<BufferTable<E>>,
    states: Vec<BufferState>,
    active: u32,
    /// One-shot lower bound for the next buffer switch.
    min_size_needed: usize,
    elem_holds: GenerationHoldList<ElemHold>,
    buffer_holds: GenerationHoldList<HeldBuffer<E>>,
}

impl<E: Send + Sync> DataStore<E> {
    /// Create a store with its first active buffer.
    pub fn new(config: BufferTypeConfig) -> Result<Self> {
        config.validate();
        let mut store = Self {
            table: Arc::new(BufferTable::new(config.max_buffers)),
            states: vec![BufferState::free(); config.max_buffers],
            active: 0,
            min_size_needed: 0,
            elem_holds: GenerationHoldList::new(),
            buffer_holds: GenerationHoldList::new(),
            config,
        };
        store.init_active_buffer()?;
        Ok(store)
    }

    pub fn config(&self) -> &BufferTypeConfig {
        &self.config
    }

    pub(crate) fn table(&self) -> Arc<BufferTable<E>> {
        Arc::clone(&self.table)
    }

    fn init_active_buffer(&mut self) -> Result<()> {
        self.switch_active_buffer(GrowthInput::default())
    }

    fn free_buffer_id(&self) -> Option<u32> {
        self.states
            .iter()
            .position(|state| state.status == BufferStatus::Free)
            .map(|id| id as u32)
    }

    /// Buffer ids that are currently free.
    pub fn num_free_buffers(&self) -> usize {
        self.states
            .iter()
            .filter(|state| state.status == BufferStatus::Free)
            .count()
    }

    /// Make a fresh buffer the allocation target.
    ///
    /// Consumes the one-shot minimum size whether or not the switch succeeds.
    fn switch_active_buffer(&mut self, mut input: GrowthInput) -> Result<()> {
        input.min_size_needed = input.min_size_needed.max(mem::take(&mut self.min_size_needed));
        let Some(id) = self.free_buffer_id() else {
            tracing::error!(max_buffers = self.config.max_buffers, "no free buffer id");
            return Err(StoreError::NoFreeBuffer {
                max_buffers: self.config.max_buffers,
            });
        };
        input.reserved_elems = if id == 0 { self.config.array_size } else { 0 };
        let capacity = growth::elems_to_alloc(&self.config, input)?;

        let previous = self.table.install(id, Segment::new(capacity, input.reserved_elems));
        debug_assert!(previous.is_none(), "free buffer {id} still had memory");
        self.states[id as usize] = BufferState::active(capacity, input.reserved_elems);
        tracing::debug!(
            from = self.active,
            to = id,
            capacity,
            live = input.used_elems.saturating_sub(input.dead_elems),
            "switched active buffer"
        );
        self.active = id;
        Ok(())
    }

    /// Make sure the active buffer can take `size` more elements, switching
    /// to a new buffer if it cannot.
    pub fn ensure_room(&mut self, size: usize) -> Result<()> {
        if self.states[self.active as usize].remaining() >= size {
            return Ok(());
        }
        let state = &self.states[self.active as usize];
        let input = GrowthInput {
            used_elems: state.payload_elems(),
            dead_elems: state.dead_elems,
            elems_needed: size,
            ..Default::default()
        };
        self.switch_active_buffer(input)
    }

    /// Allocate one element.
    pub fn allocate(&mut self, value: E) -> Result<EntryRef> {
        let entry = self.reserve(1)?;
        // SAFETY: `reserve` guarantees the element is past the published
        // length and within capacity.
        unsafe { self.active_segment().write(entry.offset(), value) };
        self.commit(1);
        Ok(entry)
    }

    /// Allocate `size` consecutive elements, initialising element `i` with
    /// `init(i)`.
    ///
    /// Fails without changing the store if a large enough buffer cannot be
    /// created.
    pub fn allocate_with(&mut self, size: usize, mut init: impl FnMut(usize) -> E) -> Result<EntryRef> {
        let entry = self.reserve(size)?;
        let segment = self.active_segment();
        for i in 0..size {
            // SAFETY: as in `allocate`.
            unsafe { segment.write(entry.offset() + i, init(i)) };
        }
        self.commit(size);
        Ok(entry)
    }

    /// Make room for `size` elements in the active buffer and return where
    /// they will go.
    fn reserve(&mut self, size: usize) -> Result<EntryRef> {
        assert!(size > 0, "empty allocation");
        assert_eq!(size % self.config.array_size, 0, "allocation not a whole number of arrays");
        self.ensure_room(size)?;
        let state = &self.states[self.active as usize];
        Ok(EntryRef::new(self.active, state.used_elems))
    }

    /// Publish `size` freshly written elements of the active buffer.
    fn commit(&mut self, size: usize) {
        let state = &mut self.states[self.active as usize];
        state.used_elems += size;
        let used = state.used_elems;
        self.active_segment().publish(used);
    }

    fn active_segment(&self) -> &Segment<E> {
        // SAFETY: the active buffer is only released through `&mut self`.
        unsafe { self.table.segment(self.active) }.expect("active buffer has memory")
    }

    /// Writer-side read of one element.
    pub fn get(&self, entry: EntryRef) -> &E {
        // SAFETY: segments are only released through `&mut self`.
        let segment = unsafe { self.table.segment(entry.buffer_id()) };
        segment
            .unwrap_or_else(|| panic!("{entry:?} points into a released buffer"))
            .get(entry.offset())
    }

    /// Writer-side read of `len` consecutive elements.
    pub fn get_array(&self, entry: EntryRef, len: usize) -> &[E] {
        // SAFETY: as in `get`.
        let segment = unsafe { self.table.segment(entry.buffer_id()) };
        segment
            .unwrap_or_else(|| panic!("{entry:?} points into a released buffer"))
            .get_slice(entry.offset(), len)
    }

    /// Put `size` elements at `entry` on the element hold list.
    ///
    /// The elements stay readable; they count as dead once trimmed.
    pub fn hold_elem(&mut self, entry: EntryRef, size: usize) {
        let state = &mut self.states[entry.buffer_id() as usize];
        assert_eq!(state.status, BufferStatus::Active, "holding element {entry:?} of a retired buffer");
        state.hold_elems += size;
        self.elem_holds.insert(ElemHold { entry, size });
    }

    pub fn active_buffer_id(&self) -> u32 {
        self.active
    }

    pub fn buffer_stats(&self, buffer_id: u32) -> BufferStats {
        self.states[buffer_id as usize].stats()
    }

    /// Ids of buffers that hold entries.
    pub fn active_buffer_ids(&self) -> BufferIds {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, state)| state.status == BufferStatus::Active)
            .map(|(id, _)| id as u32)
            .collect()
    }

    /// Request a minimum size for the next buffer switch.
    pub fn set_min_size_needed(&mut self, elems: usize) {
        self.min_size_needed = elems;
    }

    /// True if `entry` lives in a buffer being compacted.
    pub fn is_compacting(&self, entry: EntryRef) -> bool {
        self.states[entry.buffer_id() as usize].compacting
    }

    /// Start compacting every buffer that holds entries.
    ///
    /// New allocations go to a fresh buffer sized for the live data of all of
    /// them. Returns the ids being compacted.
    pub fn start_compact(&mut self) -> Result<BufferIds> {
        let ids = self.active_buffer_ids();
        let input = ids.iter().fold(GrowthInput::default(), |mut input, &id| {
            let state = &self.states[id as usize];
            input.used_elems += state.payload_elems();
            input.dead_elems += state.dead_elems + state.hold_elems;
            input
        });
        self.switch_active_buffer(input)?;
        for &id in &ids {
            self.states[id as usize].compacting = true;
        }
        tracing::debug!(buffers = ?ids.as_slice(), active = self.active, "started compaction");
        Ok(ids)
    }

    /// Start compacting the buffer with the most dead elements.
    ///
    /// The active buffer is made large enough for every live element of the
    /// chosen buffer first, so relocation cannot run out of room halfway.
    /// Returns `None` when no buffer has dead elements.
    pub fn start_compact_worst(&mut self) -> Result<Option<BufferIds>> {
        let worst = self
            .states
            .iter()
            .enumerate()
            .filter(|(_, state)| state.status == BufferStatus::Active && state.dead_elems > 0)
            .max_by_key(|(_, state)| state.dead_elems)
            .map(|(id, _)| id as u32);
        let Some(id) = worst else {
            return Ok(None);
        };
        let state = &self.states[id as usize];
        let live = state.payload_elems() - state.dead_elems - state.hold_elems;
        if id == self.active {
            let input = GrowthInput {
                used_elems: state.payload_elems(),
                dead_elems: state.dead_elems + state.hold_elems,
                ..Default::default()
            };
            self.switch_active_buffer(input)?;
        } else {
            self.ensure_room(live)?;
        }
        debug_assert!(self.states[self.active as usize].remaining() >= live);
        self.states[id as usize].compacting = true;
        tracing::debug!(buffer = id, dead = self.states[id as usize].dead_elems, "started compacting worst buffer");
        Ok(Some(BufferIds::from_slice(&[id])))
    }

    /// Abandon a compaction before anything was retired.
    pub fn cancel_compact(&mut self, ids: &[u32]) {
        for &id in ids {
            self.states[id as usize].compacting = false;
        }
        tracing::debug!(buffers = ?ids, "cancelled compaction");
    }

    /// Retire compacted buffers onto the buffer hold list.
    pub fn finish_compact(&mut self, ids: &[u32]) {
        for &id in ids {
            assert_ne!(id, self.active, "cannot retire the active buffer");
            let state = &mut self.states[id as usize];
            debug_assert!(state.compacting);
            state.status = BufferStatus::Hold;
            state.compacting = false;
            self.buffer_holds.insert(HeldBuffer::Buffer(id));
        }
        tracing::debug!(buffers = ?ids, "finished compaction");
    }

    /// Grow the active buffer in place when the growth policy fell short.
    ///
    /// Elements move to a larger allocation under the same buffer id; the old
    /// allocation stays readable until its hold entry is trimmed. The buffer
    /// is flagged as wanting compaction.
    pub fn fallback_resize(&mut self, elems_needed: usize) -> Result<()> {
        let id = self.active;
        let state = &self.states[id as usize];
        let input = GrowthInput {
            used_elems: state.payload_elems(),
            dead_elems: state.dead_elems,
            elems_needed,
            min_size_needed: mem::take(&mut self.min_size_needed),
            reserved_elems: state.reserved_elems,
        };
        let capacity = growth::elems_to_alloc(&self.config, input)?
            .max(state.used_elems + elems_needed);
        if capacity > self.config.max_elems() {
            return Err(StoreError::CapacityExceeded {
                needed: capacity as u64,
                max: self.config.max_elems() as u64,
            });
        }

        let replacement = Segment::new(capacity, state.reserved_elems);
        self.active_segment().move_into(&replacement);
        let old = self
            .table
            .install(id, replacement)
            .expect("active buffer had memory");
        self.buffer_holds.insert(HeldBuffer::Allocation(old));

        let state = &mut self.states[id as usize];
        tracing::debug!(buffer = id, from = state.capacity, to = capacity, "fallback resize");
        state.capacity = capacity;
        state.want_compact = true;
        Ok(())
    }

    /// Tag everything held since the last call with `generation`.
    pub fn transfer_hold_lists(&mut self, generation: Generation) {
        for held in self.buffer_holds.iter() {
            match held {
                HeldBuffer::Buffer(id) => {
                    let state = &mut self.states[*id as usize];
                    state.retired_generation.get_or_insert(generation);
                    self.table.mark_retired(*id, generation);
                }
                HeldBuffer::Allocation(_) => {}
            }
        }
        self.elem_holds.transfer(generation);
        self.buffer_holds.transfer(generation);
    }

    /// Release everything retired before `first_used`.
    pub fn trim_hold_lists(&mut self, first_used: Generation) {
        let states = &mut self.states;
        let elems = self.elem_holds.trim(first_used, |_, hold| {
            release_elem_hold(states, hold);
        });
        let table = &self.table;
        let buffers = self.buffer_holds.trim(first_used, |_, held| {
            release_held_buffer(table, states, held);
        });
        if elems + buffers > 0 {
            tracing::debug!(first_used, elems, buffers, "trimmed hold lists");
        }
    }

    /// Discard every entry and start over with an initial buffer of at least
    /// `init_elems` elements.
    ///
    /// The discarded allocations go on the buffer hold list, so readers that
    /// registered before the reset keep reading them until the next trim past
    /// their generation. Refs handed out before the reset are meaningless
    /// afterwards. Fails without changing anything if the initial buffer
    /// cannot be sized.
    pub fn reset(&mut self, init_elems: usize) -> Result<()> {
        let sizing = GrowthInput {
            min_size_needed: init_elems,
            reserved_elems: self.config.array_size,
            ..Default::default()
        };
        growth::elems_to_alloc(&self.config, sizing)?;

        // Pending element holds only carry accounting for buffers that are
        // about to be discarded.
        self.elem_holds.clear(drop);
        let mut discarded = 0;
        for id in 0..self.states.len() {
            if self.states[id].status != BufferStatus::Active {
                continue;
            }
            if let Some(segment) = self.table.take(id as u32) {
                self.buffer_holds.insert(HeldBuffer::Allocation(segment));
                discarded += 1;
            }
            self.states[id] = BufferState::free();
        }
        tracing::debug!(discarded, init_elems, "reset data store");
        self.min_size_needed = init_elems;
        self.init_active_buffer()
    }

    /// Address space used by the store. Held buffers count as fully dead.
    pub fn address_space(&self) -> AddressSpace {
        let mut space = AddressSpace {
            limit: self.config.max_elems() * self.config.max_buffers,
            ..Default::default()
        };
        for state in &self.states {
            match state.status {
                BufferStatus::Free => {}
                BufferStatus::Active => {
                    space.used += state.used_elems;
                    space.dead += state.dead_elems + state.reserved_elems;
                }
                BufferStatus::Hold => {
                    space.used += state.used_elems;
                    space.dead += state.used_elems;
                }
            }
        }
        space
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        let elem_bytes = mem::size_of::<E>();
        let mut usage = MemoryUsage::default();
        for state in &self.states {
            match state.status {
                BufferStatus::Free => {}
                BufferStatus::Active => {
                    usage.allocated_bytes += state.capacity * elem_bytes;
                    usage.used_bytes += state.used_elems * elem_bytes;
                    usage.dead_bytes += (state.dead_elems + state.reserved_elems) * elem_bytes;
                    usage.allocated_bytes_on_hold += state.hold_elems * elem_bytes;
                }
                BufferStatus::Hold => {
                    usage.allocated_bytes += state.capacity * elem_bytes;
                    usage.used_bytes += state.used_elems * elem_bytes;
                    usage.dead_bytes += (state.dead_elems + state.reserved_elems) * elem_bytes;
                    usage.allocated_bytes_on_hold += state.capacity * elem_bytes;
                }
            }
        }
        for held in self.buffer_holds.iter() {
            if let HeldBuffer::Allocation(segment) = held {
                usage.allocated_bytes += segment.alloc_bytes();
                usage.allocated_bytes_on_hold += segment.alloc_bytes();
            }
        }
        usage
    }
}

impl<E> Drop for DataStore<E> {
    fn drop(&mut self) {
        let table = &self.table;
        self.buffer_holds.clear(|held| {
            if let HeldBuffer::Allocation(segment) = held {
                table.adopt(segment);
            }
        });
    }
}

fn release_elem_hold(states: &mut [BufferState], hold: ElemHold) {
    let state = &mut states[hold.entry.buffer_id() as usize];
    debug_assert!(state.status != BufferStatus::Free, "element hold outlived its buffer");
    state.hold_elems -= hold.size;
    state.dead_elems += hold.size;
}

fn release_held_buffer<E>(table: &BufferTable<E>, states: &mut [BufferState], held: HeldBuffer<E>) {
    match held {
        HeldBuffer::Buffer(id) => {
            drop(table.take(id));
            states[id as usize] = BufferState::free();
        }
        HeldBuffer::Allocation(segment) => drop(segment),
    }
}
