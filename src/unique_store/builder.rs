use crate::dictionary::UniqueStoreDictionary;
use crate::entry_ref::EntryRef;
use crate::error::Result;

use super::UniqueStore;

/// Fills an empty [`UniqueStore`] from values given in ascending order.
///
/// Entries are allocated as they are added; the dictionary is replaced in
/// one step by [`finish`](Self::finish).
pub struct UniqueStoreBuilder<'a, T, D>
where
    T: Ord + Clone + Send + Sync,
    D: UniqueStoreDictionary<T>,
{
    store: &'a mut UniqueStore<T, D>,
    entries: Vec<(T, EntryRef)>,
}

impl<'a, T, D> UniqueStoreBuilder<'a, T, D>
where
    T: Ord + Clone + Send + Sync,
    D: UniqueStoreDictionary<T>,
{
    pub(super) fn new(store: &'a mut UniqueStore<T, D>, size_hint: usize) -> Self {
        Self {
            store,
            entries: Vec::with_capacity(size_hint),
        }
    }

    /// Store `value` with an initial reference count.
    ///
    /// # Panics
    /// If `value` is not greater than the previously added one.
    pub fn add(&mut self, value: T, ref_count: u32) -> Result<EntryRef> {
        if let Some((last, _)) = self.entries.last() {
            assert!(*last < value, "builder values must be strictly ascending");
        }
        let entry_ref = self.store.allocate_sorted(value.clone(), ref_count)?;
        self.entries.push((value, entry_ref));
        Ok(entry_ref)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Install the built dictionary.
    pub fn finish(self) {
        tracing::debug!(entries = self.entries.len(), "built unique store");
        self.store.assign_sorted(self.entries);
    }
}
