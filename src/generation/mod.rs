//! Generation tracking for deferred reclamation.
//!
//! The writer advances a generation counter at every mutation boundary.
//! Readers register under the current generation by taking a
//! [`GenerationGuard`] and deregister by dropping it. The oldest generation
//! with a live guard is the *first used* generation: anything the writer
//! retired while an older generation was current is safe to free once
//! `first_used` has moved past it.
//!
//! Taking a guard costs a shared lock acquisition and one atomic increment;
//! dropping it is one atomic decrement. The writer never waits for readers.
//!
//! Every handler has an identity that its guards carry. Stores bound to a
//! handler reject guards from any other one, and derive their hold list tags
//! and trim bounds from the handler instead of taking them as arguments.

mod hold_list;

pub use hold_list::GenerationHoldList;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Logical timestamp of a writer mutation boundary.
pub type Generation = u64;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Reader count for one generation.
#[derive(Debug)]
struct GenerationHold {
    generation: Generation,
    handler_id: u64,
    readers: AtomicUsize,
}

impl GenerationHold {
    fn new(generation: Generation, handler_id: u64) -> Arc<Self> {
        Arc::new(Self {
            generation,
            handler_id,
            readers: AtomicUsize::new(0),
        })
    }
}

#[derive(Debug)]
struct Shared {
    id: u64,
    /// Hold new readers register on.
    current: RwLock<Arc<GenerationHold>>,
    current_generation: AtomicU64,
    first_used_generation: AtomicU64,
}

/// Writer side of the generation protocol.
///
/// Mutating methods take `&mut self`; the handler is owned by the single
/// writer. Readers take guards through [`GenerationHandler::readers`].
#[derive(Debug)]
pub struct GenerationHandler {
    shared: Arc<Shared>,
    /// Superseded holds that may still have readers, oldest first.
    old_holds: VecDeque<Arc<GenerationHold>>,
}

impl GenerationHandler {
    pub fn new() -> Self {
        let id = NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: Arc::new(Shared {
                id,
                current: RwLock::new(GenerationHold::new(0, id)),
                current_generation: AtomicU64::new(0),
                first_used_generation: AtomicU64::new(0),
            }),
            old_holds: VecDeque::new(),
        }
    }

    /// Handle readers use to register.
    pub fn readers(&self) -> GenerationReaders {
        GenerationReaders {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Register a reader under the current generation.
    pub fn take_guard(&self) -> GenerationGuard {
        take_guard(&self.shared)
    }

    pub fn current_generation(&self) -> Generation {
        self.shared.current_generation.load(Ordering::Acquire)
    }

    pub fn first_used_generation(&self) -> Generation {
        self.shared.first_used_generation.load(Ordering::Acquire)
    }

    pub(crate) fn handler_id(&self) -> u64 {
        self.shared.id
    }

    /// Advance to the next generation.
    ///
    /// Returns the generation that was current before the call; resources
    /// retired during the mutation that just finished are tagged with it.
    pub fn increment_generation(&mut self) -> Generation {
        let previous = self.current_generation();
        let next = GenerationHold::new(previous + 1, self.shared.id);
        self.shared
            .current_generation
            .store(previous + 1, Ordering::Release);
        let old = std::mem::replace(&mut *self.shared.current.write(), next);
        self.old_holds.push_back(old);
        let first_used = self.update_first_used_generation();
        tracing::trace!(generation = previous + 1, first_used, "incremented generation");
        previous
    }

    /// Recompute the oldest generation still used by a reader.
    pub fn update_first_used_generation(&mut self) -> Generation {
        while let Some(front) = self.old_holds.front() {
            if front.readers.load(Ordering::Acquire) != 0 {
                break;
            }
            self.old_holds.pop_front();
        }
        let first_used = self
            .old_holds
            .front()
            .map_or_else(|| self.current_generation(), |hold| hold.generation);
        let previous = self
            .shared
            .first_used_generation
            .swap(first_used, Ordering::AcqRel);
        debug_assert!(previous <= first_used, "first used generation went backwards");
        first_used
    }

    /// Readers registered under `generation`.
    pub fn generation_ref_count(&self, generation: Generation) -> usize {
        if generation == self.current_generation() {
            return self.shared.current.read().readers.load(Ordering::Acquire);
        }
        self.old_holds
            .iter()
            .find(|hold| hold.generation == generation)
            .map_or(0, |hold| hold.readers.load(Ordering::Acquire))
    }

    /// True if any reader is registered.
    pub fn has_readers(&self) -> bool {
        self.old_holds
            .iter()
            .any(|hold| hold.readers.load(Ordering::Acquire) != 0)
            || self.shared.current.read().readers.load(Ordering::Acquire) != 0
    }
}

impl Default for GenerationHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable reader-side handle to a [`GenerationHandler`].
#[derive(Debug, Clone)]
pub struct GenerationReaders {
    shared: Arc<Shared>,
}

impl GenerationReaders {
    /// Register a reader under the current generation.
    pub fn take_guard(&self) -> GenerationGuard {
        take_guard(&self.shared)
    }

    pub fn current_generation(&self) -> Generation {
        self.shared.current_generation.load(Ordering::Acquire)
    }

    /// Oldest generation a reader was still registered under when the
    /// writer last updated it.
    pub fn first_used_generation(&self) -> Generation {
        self.shared.first_used_generation.load(Ordering::Acquire)
    }

    pub(crate) fn handler_id(&self) -> u64 {
        self.shared.id
    }
}

fn take_guard(shared: &Shared) -> GenerationGuard {
    let current = shared.current.read();
    // Incremented under the read lock so the writer observes it once it has
    // swapped this hold out.
    current.readers.fetch_add(1, Ordering::AcqRel);
    GenerationGuard {
        hold: Arc::clone(&current),
    }
}

/// A registered reader.
///
/// While the guard lives, nothing retired at or after its generation is
/// freed. Dropping it deregisters the reader.
#[must_use]
#[derive(Debug)]
pub struct GenerationGuard {
    hold: Arc<GenerationHold>,
}

impl GenerationGuard {
    /// Generation this reader registered under.
    pub fn generation(&self) -> Generation {
        self.hold.generation
    }

    pub(crate) fn handler_id(&self) -> u64 {
        self.hold.handler_id
    }
}

impl Clone for GenerationGuard {
    fn clone(&self) -> Self {
        self.hold.readers.fetch_add(1, Ordering::AcqRel);
        Self {
            hold: Arc::clone(&self.hold),
        }
    }
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        self.hold.readers.fetch_sub(1, Ordering::Release);
    }
}
