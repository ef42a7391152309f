//! Buffers: raw element storage plus the writer's bookkeeping.
//!
//! A [`Segment`] is one fixed-capacity allocation. The writer initialises
//! elements past the published length and then publishes the new length with a
//! release store; readers load the length with acquire before touching an
//! element, so every element they can reach is fully written.
//!
//! Segments are installed in a [`BufferTable`] shared with readers. A segment
//! is only removed from the table (and dropped) when a hold list releases it.
//! Each slot carries a sequence number and the generation its segment was
//! retired at, so a reader can tell whether the segment it is about to touch
//! is still protected by its guard.

use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::generation::Generation;

/// One allocation of `capacity` elements.
pub(crate) struct Segment<E> {
    ptr: NonNull<E>,
    capacity: usize,
    /// Capacity of the backing `Vec`, needed to give the memory back.
    alloc_capacity: usize,
    /// Leading elements that are never initialised.
    reserved: usize,
    used: AtomicUsize,
    /// Cleared once the elements were moved bitwise into a replacement.
    owns_elems: AtomicBool,
    _owns: PhantomData<E>,
}

// Elements are shared with readers (`Sync`) and dropped by the writer thread
// that releases the segment (`Send`).
unsafe impl<E: Send + Sync> Send for Segment<E> {}
unsafe impl<E: Send + Sync> Sync for Segment<E> {}

impl<E> Segment<E> {
    pub(crate) fn new(capacity: usize, reserved: usize) -> Box<Self> {
        assert!(reserved <= capacity);
        let mut storage = ManuallyDrop::new(Vec::<E>::with_capacity(capacity));
        let ptr = NonNull::new(storage.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Box::new(Self {
            ptr,
            capacity,
            alloc_capacity: storage.capacity(),
            reserved,
            used: AtomicUsize::new(reserved),
            owns_elems: AtomicBool::new(true),
            _owns: PhantomData,
        })
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub(crate) fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub(crate) fn alloc_bytes(&self) -> usize {
        self.capacity * mem::size_of::<E>()
    }

    /// Initialise the element at `index`.
    ///
    /// # Safety
    /// Only the writer may call this, with `used() <= index < capacity()`, and
    /// each index at most once before it is published.
    #[inline]
    pub(crate) unsafe fn write(&self, index: usize, value: E) {
        debug_assert!(index >= self.used.load(Ordering::Relaxed) && index < self.capacity);
        unsafe { self.ptr.as_ptr().add(index).write(value) };
    }

    /// Make every element below `used` visible to readers.
    #[inline]
    pub(crate) fn publish(&self, used: usize) {
        debug_assert!(used <= self.capacity);
        self.used.store(used, Ordering::Release);
    }

    #[inline]
    pub(crate) fn get(&self, index: usize) -> &E {
        assert!(
            index >= self.reserved && index < self.used(),
            "element {index} is not initialised"
        );
        // SAFETY: published elements are initialised and never mutated
        // through a unique reference again.
        unsafe { &*self.ptr.as_ptr().add(index) }
    }

    #[inline]
    pub(crate) fn get_slice(&self, index: usize, len: usize) -> &[E] {
        assert!(
            index >= self.reserved && index + len <= self.used(),
            "elements {index}..{} are not initialised",
            index + len
        );
        // SAFETY: as for `get`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(index), len) }
    }

    /// Move every element into `dst`, which must be at least as large.
    ///
    /// Readers may keep reading `self`: its memory stays intact, but it no
    /// longer drops the moved elements.
    pub(crate) fn move_into(&self, dst: &Segment<E>) {
        let used = self.used();
        assert!(dst.capacity >= used && dst.reserved == self.reserved);
        assert_eq!(dst.used(), dst.reserved, "destination must be empty");
        // SAFETY: ranges are initialised in `self`, uninitialised in `dst`,
        // and belong to different allocations.
        unsafe {
            ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(self.reserved),
                dst.ptr.as_ptr().add(self.reserved),
                used - self.reserved,
            );
        }
        self.owns_elems.store(false, Ordering::Release);
        dst.publish(used);
    }
}

impl<E> Drop for Segment<E> {
    fn drop(&mut self) {
        let used = *self.used.get_mut();
        // SAFETY: the segment is exclusively owned here; elements in
        // `reserved..used` are initialised unless they were moved out.
        unsafe {
            if *self.owns_elems.get_mut() {
                ptr::drop_in_place(ptr::slice_from_raw_parts_mut(
                    self.ptr.as_ptr().add(self.reserved),
                    used - self.reserved,
                ));
            }
            drop(Vec::from_raw_parts(self.ptr.as_ptr(), 0, self.alloc_capacity));
        }
    }
}

struct Slot<E> {
    segment: AtomicPtr<Segment<E>>,
    /// Odd while the writer replaces `segment`.
    seq: AtomicU64,
    /// Generation the installed segment was retired at, `Generation::MAX`
    /// while it is live.
    retired: AtomicU64,
}

impl<E> Slot<E> {
    fn empty() -> Self {
        Self {
            segment: AtomicPtr::new(ptr::null_mut()),
            seq: AtomicU64::new(0),
            retired: AtomicU64::new(Generation::MAX),
        }
    }
}

/// Buffer slots shared between the writer and readers.
pub(crate) struct BufferTable<E> {
    slots: Box<[Slot<E>]>,
    /// Allocations a dropped store still had on hold. They live as long as
    /// the last reader handle.
    orphans: Mutex<Vec<Box<Segment<E>>>>,
    _marker: PhantomData<Segment<E>>,
}

impl<E> BufferTable<E> {
    pub(crate) fn new(num_buffers: usize) -> Self {
        Self {
            slots: (0..num_buffers).map(|_| Slot::empty()).collect(),
            orphans: Mutex::new(Vec::new()),
            _marker: PhantomData,
        }
    }

    /// Segment currently installed for `buffer_id`, if any.
    ///
    /// # Safety
    /// Writer side only: the caller holds a borrow of the owning store, so no
    /// segment can be released while the returned reference lives.
    #[inline]
    pub(crate) unsafe fn segment(&self, buffer_id: u32) -> Option<&Segment<E>> {
        let ptr = self.slots[buffer_id as usize].segment.load(Ordering::Acquire);
        // SAFETY: non-null slots point at live boxed segments per the
        // caller's contract.
        unsafe { ptr.as_ref() }
    }

    /// Segment installed for `buffer_id`, as seen by a reader registered
    /// under `generation`.
    ///
    /// Returns `None` for an empty slot.
    ///
    /// # Panics
    /// If the segment was retired before `generation`: nothing keeps it
    /// alive for this reader.
    ///
    /// # Safety
    /// The caller must hold a guard registered under `generation` with the
    /// handler that tags this table's retirements, and the guard must outlive
    /// the returned reference.
    pub(crate) unsafe fn reader_segment(&self, buffer_id: u32, generation: Generation) -> Option<&Segment<E>> {
        let slot = &self.slots[buffer_id as usize];
        loop {
            let before = slot.seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let ptr = slot.segment.load(Ordering::Acquire);
            let retired = slot.retired.load(Ordering::Acquire);
            fence(Ordering::Acquire);
            if slot.seq.load(Ordering::Relaxed) != before {
                continue;
            }
            if ptr.is_null() {
                return None;
            }
            assert!(
                generation <= retired,
                "stale ref into buffer {buffer_id}: retired at generation {retired}, read at {generation}"
            );
            // SAFETY: `ptr` was installed while the slot said the segment is
            // live for `generation`; it is only dropped after a trim past its
            // retirement generation, which the caller's guard prevents.
            return Some(unsafe { &*ptr });
        }
    }

    /// Swap the slot's segment inside a sequence window.
    fn replace(&self, buffer_id: u32, new: *mut Segment<E>) -> Option<Box<Segment<E>>> {
        let slot = &self.slots[buffer_id as usize];
        let seq = slot.seq.load(Ordering::Relaxed);
        slot.seq.store(seq + 1, Ordering::Relaxed);
        fence(Ordering::Release);
        let old = slot.segment.swap(new, Ordering::AcqRel);
        slot.retired.store(Generation::MAX, Ordering::Release);
        slot.seq.store(seq + 2, Ordering::Release);
        // SAFETY: slots only ever hold pointers from `Box::into_raw`.
        (!old.is_null()).then(|| unsafe { Box::from_raw(old) })
    }

    /// Install `segment`, returning whatever was installed before.
    pub(crate) fn install(&self, buffer_id: u32, segment: Box<Segment<E>>) -> Option<Box<Segment<E>>> {
        self.replace(buffer_id, Box::into_raw(segment))
    }

    /// Remove the segment for `buffer_id`.
    pub(crate) fn take(&self, buffer_id: u32) -> Option<Box<Segment<E>>> {
        self.replace(buffer_id, ptr::null_mut())
    }

    /// Record that the installed segment was retired at `generation`.
    pub(crate) fn mark_retired(&self, buffer_id: u32, generation: Generation) {
        self.slots[buffer_id as usize]
            .retired
            .fetch_min(generation, Ordering::AcqRel);
    }

    /// Keep `segment` alive until the table itself is dropped.
    pub(crate) fn adopt(&self, segment: Box<Segment<E>>) {
        self.orphans.lock().push(segment);
    }
}

impl<E> Drop for BufferTable<E> {
    fn drop(&mut self) {
        for id in 0..self.slots.len() {
            drop(self.take(id as u32));
        }
    }
}

/// Lifecycle of a buffer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    /// No memory allocated; the id can be reused.
    Free,
    /// Holds entries (possibly read-only if it is not the allocation target).
    Active,
    /// Retired; readable until its hold list entry is trimmed.
    Hold,
}

/// Writer-side header of a buffer.
#[derive(Debug, Clone)]
pub(crate) struct BufferState {
    pub(crate) status: BufferStatus,
    pub(crate) capacity: usize,
    /// Elements handed out, reserved ones included.
    pub(crate) used_elems: usize,
    pub(crate) reserved_elems: usize,
    pub(crate) dead_elems: usize,
    pub(crate) hold_elems: usize,
    pub(crate) compacting: bool,
    pub(crate) want_compact: bool,
    pub(crate) retired_generation: Option<Generation>,
}

impl BufferState {
    pub(crate) fn free() -> Self {
        Self {
            status: BufferStatus::Free,
            capacity: 0,
            used_elems: 0,
            reserved_elems: 0,
            dead_elems: 0,
            hold_elems: 0,
            compacting: false,
            want_compact: false,
            retired_generation: None,
        }
    }

    pub(crate) fn active(capacity: usize, reserved: usize) -> Self {
        Self {
            status: BufferStatus::Active,
            capacity,
            used_elems: reserved,
            reserved_elems: reserved,
            ..Self::free()
        }
    }

    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.capacity - self.used_elems
    }

    /// Payload elements handed out, reserved ones excluded.
    #[inline]
    pub(crate) fn payload_elems(&self) -> usize {
        self.used_elems - self.reserved_elems
    }

    pub(crate) fn stats(&self) -> BufferStats {
        BufferStats {
            status: self.status,
            capacity: self.capacity,
            used_elems: self.used_elems,
            dead_elems: self.dead_elems,
            hold_elems: self.hold_elems,
            reserved_elems: self.reserved_elems,
            compacting: self.compacting,
            want_compact: self.want_compact,
            retired_generation: self.retired_generation,
        }
    }
}

/// Snapshot of a buffer's accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferStats {
    pub status: BufferStatus,
    pub capacity: usize,
    /// Elements handed out, reserved ones included.
    pub used_elems: usize,
    /// Elements released by a hold list trim.
    pub dead_elems: usize,
    /// Elements freed but still on a hold list.
    pub hold_elems: usize,
    pub reserved_elems: usize,
    pub compacting: bool,
    pub want_compact: bool,
    pub retired_generation: Option<Generation>,
}
