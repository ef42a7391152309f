use std::sync::Arc;

use crate::datastore::BufferTable;
use crate::dictionary::{FrozenRefs, FrozenView};
use crate::entry_ref::EntryRef;
use crate::generation::GenerationGuard;

use super::UniqueEntry;

/// Read-only view of a [`UniqueStore`](super::UniqueStore) for other threads.
///
/// Every read takes the caller's [`GenerationGuard`]; references returned
/// live no longer than the guard, and the writer does not release anything a
/// guard could still reach.
///
/// # Panics
/// Reads panic when the guard comes from a different generation handler
/// than the store's, and when a ref points into a buffer that was retired
/// before the guard was taken.
pub struct UniqueStoreReader<T> {
    table: Arc<BufferTable<UniqueEntry<T>>>,
    frozen: FrozenView,
    handler_id: u64,
}

impl<T> Clone for UniqueStoreReader<T> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
            frozen: self.frozen.clone(),
            handler_id: self.handler_id,
        }
    }
}

impl<T: Send + Sync> UniqueStoreReader<T> {
    pub(super) fn new(table: Arc<BufferTable<UniqueEntry<T>>>, frozen: FrozenView, handler_id: u64) -> Self {
        Self {
            table,
            frozen,
            handler_id,
        }
    }

    #[inline]
    fn check_guard(&self, guard: &GenerationGuard) {
        assert_eq!(
            guard.handler_id(),
            self.handler_id,
            "guard was taken from another generation handler"
        );
    }

    fn entry<'a>(&'a self, entry_ref: EntryRef, guard: &'a GenerationGuard) -> &'a UniqueEntry<T> {
        self.check_guard(guard);
        // SAFETY: the guard belongs to the handler that tags this table's
        // retirements and outlives the returned reference.
        let segment = unsafe { self.table.reader_segment(entry_ref.buffer_id(), guard.generation()) }
            .unwrap_or_else(|| panic!("{entry_ref:?} points into a released buffer"));
        segment.get(entry_ref.offset())
    }

    /// Value stored at `entry_ref`.
    pub fn get<'a>(&'a self, entry_ref: EntryRef, guard: &'a GenerationGuard) -> &'a T {
        self.entry(entry_ref, guard).value()
    }

    /// Reference count at the time of the read.
    pub fn ref_count(&self, entry_ref: EntryRef, guard: &GenerationGuard) -> u32 {
        self.entry(entry_ref, guard).ref_count()
    }

    /// Refs in ascending value order as of the writer's last freeze.
    pub fn frozen_refs<'a>(&'a self, guard: &'a GenerationGuard) -> &'a FrozenRefs {
        self.check_guard(guard);
        self.frozen.refs(guard)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::BufferTypeConfig;
    use crate::generation::GenerationHandler;
    use crate::unique_store::UniqueStore;

    fn config() -> BufferTypeConfig {
        BufferTypeConfig::default()
            .with_min_arrays(4)
            .with_max_arrays(1 << 14)
            .with_alloc_alignment(4)
            .with_slack_elems(4)
            .with_max_buffers(64)
    }

    #[test]
    fn test_guarded_reads_survive_removal_and_compaction() {
        let mut handler = GenerationHandler::new();
        let mut store: UniqueStore<String> = UniqueStore::new(config(), &handler).unwrap();
        let reader = store.reader();
        let r = store.add(&"kept".to_string()).unwrap().entry_ref;
        let gone = store.add(&"gone".to_string()).unwrap().entry_ref;
        store.freeze();

        let guard = handler.take_guard();
        store.remove(gone);
        store.commit(&mut handler);
        assert_eq!(reader.get(gone, &guard), "gone");
        assert_eq!(reader.ref_count(gone, &guard), 0);

        let ids = store.start_compact(0).unwrap();
        let map = store.relocate(ids.clone()).unwrap();
        store.finish_compaction(&ids);
        store.commit(&mut handler);

        assert_eq!(reader.get(r, &guard), "kept", "old location still readable");
        assert_eq!(reader.get(map.translate(r), &guard), "kept");
        drop(guard);

        let guard = handler.take_guard();
        let refs = reader.frozen_refs(&guard);
        assert_eq!(refs.len(), 1);
        assert_eq!(reader.get(refs[0], &guard), "kept");
    }

    #[test]
    #[should_panic(expected = "another generation handler")]
    fn test_foreign_guard_panics() {
        let handler = GenerationHandler::new();
        let other = GenerationHandler::new();
        let mut store: UniqueStore<u32> = UniqueStore::new(config(), &handler).unwrap();
        let reader = store.reader();
        let r = store.add(&1).unwrap().entry_ref;
        let guard = other.take_guard();
        let _ = reader.get(r, &guard);
    }

    #[test]
    #[should_panic(expected = "stale ref")]
    fn test_stale_ref_under_newer_guard_panics() {
        let mut handler = GenerationHandler::new();
        let mut store: UniqueStore<u32> = UniqueStore::new(config(), &handler).unwrap();
        let reader = store.reader();
        let r = store.add(&1).unwrap().entry_ref;
        let pin = handler.take_guard();
        let ids = store.start_compact(0).unwrap();
        store.relocate(ids.clone()).unwrap();
        store.finish_compaction(&ids);
        store.commit(&mut handler);

        // The old buffer is still held for `pin`, but a guard taken after
        // its retirement has no claim on it.
        let late = handler.take_guard();
        assert!(late.generation() > pin.generation());
        let _ = reader.get(r, &late);
    }

    #[test]
    fn test_concurrent_readers_see_sorted_snapshots() {
        use rand::{Rng, SeedableRng};
        use std::sync::atomic::{AtomicBool, Ordering};

        let mut handler = GenerationHandler::new();
        let generations = handler.readers();
        let mut store: UniqueStore<u64> = UniqueStore::new(config(), &handler).unwrap();
        let reader = store.reader();
        let stop = AtomicBool::new(false);

        std::thread::scope(|s| {
            for _ in 0..4 {
                let reader = reader.clone();
                let generations = generations.clone();
                let stop = &stop;
                s.spawn(move || {
                    let mut reads = 0usize;
                    while !stop.load(Ordering::Relaxed) {
                        let guard = generations.take_guard();
                        let refs = reader.frozen_refs(&guard);
                        let values: Vec<u64> = refs.iter().map(|r| *reader.get(r, &guard)).collect();
                        assert!(values.windows(2).all(|w| w[0] < w[1]), "snapshot out of order");
                        reads += values.len();
                    }
                    reads
                });
            }

            let mut rng = rand::rngs::StdRng::seed_from_u64(7);
            let mut live: Vec<(u64, crate::entry_ref::EntryRef)> = Vec::new();
            for round in 0..2_000 {
                for _ in 0..8 {
                    if live.len() < 64 || rng.gen_bool(0.5) {
                        let value = rng.gen_range(0..512);
                        let added = store.add(&value).unwrap();
                        live.push((value, added.entry_ref));
                    } else {
                        let (_, r) = live.swap_remove(rng.gen_range(0..live.len()));
                        store.remove(r);
                    }
                }
                if round % 16 == 0 {
                    if let Some(ctx) = store.compact_worst().unwrap() {
                        let mut refs: Vec<_> = live.iter().map(|(_, r)| *r).collect();
                        ctx.compact(&mut refs);
                        ctx.finish();
                        for ((_, r), moved) in live.iter_mut().zip(refs) {
                            *r = moved;
                        }
                    }
                }
                store.commit(&mut handler);
            }
            stop.store(true, Ordering::Relaxed);
        });

        for (value, r) in store.iter() {
            assert_eq!(store.get(r), value);
        }
    }
}
