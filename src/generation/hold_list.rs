//! Deferred-free queues tagged with generations.

use std::collections::VecDeque;

use super::Generation;

/// A queue of retired resources waiting for readers to move on.
///
/// Resources are first staged without a generation. When the writer reaches a
/// mutation boundary it tags everything staged with the current generation
/// ([`transfer`](Self::transfer)). A tagged resource is released by
/// [`trim`](Self::trim) once the oldest generation still used by a reader is
/// strictly greater than its tag.
#[derive(Debug)]
pub struct GenerationHoldList<T> {
    staged: Vec<T>,
    tagged: VecDeque<(Generation, T)>,
}

impl<T> GenerationHoldList<T> {
    pub fn new() -> Self {
        Self {
            staged: Vec::new(),
            tagged: VecDeque::new(),
        }
    }

    /// Stage a retired resource.
    pub fn insert(&mut self, item: T) {
        self.staged.push(item);
    }

    /// Tag every staged resource with `generation`.
    pub fn transfer(&mut self, generation: Generation) {
        debug_assert!(
            self.tagged.back().map_or(true, |(g, _)| *g <= generation),
            "hold list generations must not decrease"
        );
        self.tagged
            .extend(self.staged.drain(..).map(|item| (generation, item)));
    }

    /// Release every tagged resource retired before `first_used`.
    ///
    /// Returns the number of resources released.
    pub fn trim(&mut self, first_used: Generation, mut release: impl FnMut(Generation, T)) -> usize {
        let mut released = 0;
        while let Some((generation, _)) = self.tagged.front() {
            if *generation >= first_used {
                break;
            }
            if let Some((generation, item)) = self.tagged.pop_front() {
                release(generation, item);
                released += 1;
            }
        }
        released
    }

    /// Release everything, staged or tagged.
    ///
    /// Only valid when no reader can observe any held resource.
    pub fn clear(&mut self, mut release: impl FnMut(T)) {
        for (_, item) in self.tagged.drain(..) {
            release(item);
        }
        for item in self.staged.drain(..) {
            release(item);
        }
    }

    /// Staged plus tagged entries.
    pub fn len(&self) -> usize {
        self.staged.len() + self.tagged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over everything held, staged entries last.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.tagged.iter().map(|(_, item)| item).chain(self.staged.iter())
    }

    /// Oldest tag still held.
    pub fn oldest_generation(&self) -> Option<Generation> {
        self.tagged.front().map(|(g, _)| *g)
    }
}

impl<T> Default for GenerationHoldList<T> {
    fn default() -> Self {
        Self::new()
    }
}
