use super::*;

use proptest::prelude::*;
use std::collections::BTreeMap;

type Model = BTreeMap<Vec<u8>, (u32, EntryRef)>;

fn config() -> BufferTypeConfig {
    BufferTypeConfig::default()
        .with_min_arrays(4)
        .with_max_arrays(1 << 16)
        .with_alloc_alignment(4)
        .with_slack_elems(16)
        .with_max_buffers(128)
}

fn validate_store(store: &EnumStore<Vec<u8>>, model: &Model) {
    assert_eq!(store.num_uniques(), model.len(), "one entry per distinct value");

    let got: Vec<(Vec<u8>, EntryRef)> = store
        .unique_store()
        .iter()
        .map(|(value, entry_ref)| (value.clone(), entry_ref))
        .collect();
    let expected: Vec<(Vec<u8>, EntryRef)> = model.iter().map(|(k, (_, r))| (k.clone(), *r)).collect();
    assert_eq!(got, expected, "dictionary must match the model in order");

    for (value, (count, entry_ref)) in model {
        assert_eq!(store.get(*entry_ref), value);
        assert_eq!(store.ref_count(*entry_ref), *count);
    }

    let data_store = store.unique_store().data_store();
    for id in data_store.active_buffer_ids() {
        let stats = data_store.buffer_stats(id);
        assert!(stats.used_elems <= stats.capacity, "buffer {id} overflowed");
        assert!(
            stats.dead_elems + stats.hold_elems <= stats.used_elems - stats.reserved_elems,
            "buffer {id} has more freed than used elements"
        );
        assert!(!stats.compacting, "compaction left unfinished");
    }
    let space = store.address_space_usage();
    assert!(space.used - space.dead >= model.len());
}

#[derive(Clone, Debug)]
enum Op {
    Add(Vec<u8>),
    Remove(Vec<u8>),
    Boundary,
    TakeGuard,
    DropGuard,
    CompactWorst,
    CompactAll,
}

fn value_strategy() -> impl Strategy<Value = Vec<u8>> + Clone {
    // A small alphabet keeps duplicates frequent.
    prop::collection::vec(0u8..4, 0..=3)
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    let value = value_strategy();
    let op = prop_oneof![
        40 => value.clone().prop_map(Op::Add),
        30 => value.prop_map(Op::Remove),
        15 => Just(Op::Boundary),
        4 => Just(Op::TakeGuard),
        4 => Just(Op::DropGuard),
        4 => Just(Op::CompactWorst),
        3 => Just(Op::CompactAll),
    ];
    prop::collection::vec(op, 0..=400)
}

fn translate_model(model: &mut Model, translate: impl Fn(EntryRef) -> EntryRef) {
    for (_, entry_ref) in model.values_mut() {
        *entry_ref = translate(*entry_ref);
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 50_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_equivalence_with_refcount_model(ops in ops_strategy()) {
        let mut handler = GenerationHandler::new();
        let mut store: EnumStore<Vec<u8>> = EnumStore::new(0, config(), &handler).unwrap();
        let reader = store.reader();
        let mut model = Model::new();
        // Entries seen by the pinned reader, with the values it saw.
        let mut pinned: Option<(GenerationGuard, Vec<(EntryRef, Vec<u8>)>)> = None;

        for op in ops {
            match op {
                Op::Add(value) => {
                    let added = store.add(&value).unwrap();
                    let slot = model.entry(value).or_insert((0, added.entry_ref));
                    prop_assert_eq!(added.inserted, slot.0 == 0);
                    prop_assert_eq!(added.entry_ref, slot.1);
                    slot.0 += 1;
                }
                Op::Remove(value) => {
                    let Some(slot) = model.get_mut(&value) else {
                        prop_assert_eq!(store.find(&value), None);
                        continue;
                    };
                    store.remove(slot.1);
                    slot.0 -= 1;
                    if slot.0 == 0 {
                        model.remove(&value);
                        prop_assert_eq!(store.find(&value), None);
                    }
                }
                Op::Boundary => {
                    store.freeze();
                    store.transfer_hold_lists();
                    handler.increment_generation();
                    let first_used = handler.first_used_generation();
                    if let Some((guard, _)) = &pinned {
                        prop_assert!(first_used <= guard.generation());
                    }
                    store.trim_hold_lists();
                }
                Op::TakeGuard => {
                    if pinned.is_none() {
                        let guard = handler.take_guard();
                        let seen = model.iter().map(|(k, (_, r))| (*r, k.clone())).collect();
                        pinned = Some((guard, seen));
                    }
                }
                Op::DropGuard => {
                    pinned = None;
                    handler.update_first_used_generation();
                }
                Op::CompactWorst => {
                    if let Some(ctx) = store.compact_worst().unwrap() {
                        translate_model(&mut model, |r| ctx.translate(r));
                        ctx.finish();
                    }
                }
                Op::CompactAll => {
                    if store.pre_compact(0).unwrap() {
                        let map = store.perform_compaction().unwrap();
                        translate_model(&mut model, |r| map.translate(r));
                        store.post_compact();
                    }
                }
            }

            if let Some((guard, seen)) = &pinned {
                for (entry_ref, value) in seen {
                    prop_assert_eq!(reader.get(*entry_ref, guard), value);
                }
            }
        }

        validate_store(&store, &model);
    }

    #[test]
    fn prop_first_used_tracks_oldest_guard(steps in prop::collection::vec(0u8..3, 0..=200)) {
        let mut handler = GenerationHandler::new();
        let mut guards: Vec<GenerationGuard> = Vec::new();
        let mut last = 0;

        for step in steps {
            match step {
                0 => guards.push(handler.take_guard()),
                1 => if !guards.is_empty() { guards.remove(0); },
                _ => { handler.increment_generation(); }
            }
            let first_used = handler.update_first_used_generation();
            let oldest = guards
                .iter()
                .map(GenerationGuard::generation)
                .min()
                .unwrap_or(handler.current_generation());
            prop_assert!(first_used >= last, "first used went backwards");
            prop_assert_eq!(first_used, oldest);
            last = first_used;
        }
    }

    #[test]
    fn prop_reload_preserves_values_and_counts(
        values in prop::collection::btree_set(value_strategy(), 0..=40),
        counts in prop::collection::vec(0u32..3, 40),
    ) {
        let handler = GenerationHandler::new();
        let mut source: EnumStore<Vec<u8>> = EnumStore::new(0, config(), &handler).unwrap();
        for value in &values {
            source.add(value).unwrap();
        }
        let bytes = source.serialize();

        let mut loaded: EnumStore<Vec<u8>> = EnumStore::new(0, config(), &handler).unwrap();
        let refs = loaded.deserialize(&bytes).unwrap();
        prop_assert_eq!(refs.len(), values.len());

        let hist = &counts[..values.len()];
        loaded.fixup_ref_counts(hist);
        let mut model = Model::new();
        for ((value, &count), &entry_ref) in values.iter().zip(hist).zip(&refs) {
            if count > 0 {
                model.insert(value.clone(), (count, entry_ref));
            }
        }
        validate_store(&loaded, &model);
    }
}

#[test]
fn exhaustive_remove_order_small_set() {
    let values: Vec<Vec<u8>> = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()];

    for_each_permutation(&values, |perm| {
        let mut handler = GenerationHandler::new();
        let mut store: EnumStore<Vec<u8>> = EnumStore::new(0, config(), &handler).unwrap();
        let mut model = Model::new();
        for value in &values {
            let r = store.add(value).unwrap().entry_ref;
            model.insert(value.clone(), (1, r));
        }

        for value in perm {
            let (_, r) = model.remove(&value).unwrap();
            store.remove(r);
            store.commit(&mut handler);
            if let Some(ctx) = store.compact_worst().unwrap() {
                translate_model(&mut model, |r| ctx.translate(r));
                ctx.finish();
            }
            validate_store(&store, &model);
        }
        assert_eq!(store.num_uniques(), 0);
    });
}

fn for_each_permutation<T: Clone>(items: &[T], mut f: impl FnMut(Vec<T>)) {
    fn rec<T: Clone>(items: &[T], used: &mut [bool], out: &mut Vec<T>, f: &mut impl FnMut(Vec<T>)) {
        if out.len() == items.len() {
            f(out.clone());
            return;
        }
        for i in 0..items.len() {
            if used[i] {
                continue;
            }
            used[i] = true;
            out.push(items[i].clone());
            rec(items, used, out, f);
            out.pop();
            used[i] = false;
        }
    }

    let mut used = vec![false; items.len()];
    let mut out = Vec::with_capacity(items.len());
    rec(items, &mut used, &mut out, &mut f);
}
