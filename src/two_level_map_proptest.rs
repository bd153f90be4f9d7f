#![cfg(test)]

// Property tests for TwoLevelMap kept inside the crate next to the unit tests
// so they run with the same debug reentrancy checks enabled.

use crate::finalizer::{finalizer, Finalizer};
use crate::two_level_map::TwoLevelMap;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type Model = BTreeMap<u8, BTreeMap<u8, usize>>;

#[derive(Clone, Debug)]
enum Op {
    Put(u8, u8, usize),
    Delete(u8, u8),
    Drop(u8),
    SyncTo(Vec<(u8, u8)>),
}

fn arb_pairs() -> impl Strategy<Value = Vec<(u8, u8)>> {
    proptest::collection::vec((0u8..6, 0u8..6), 0..20)
}

fn arb_ops() -> impl Strategy<Value = Vec<Op>> {
    let op = prop_oneof![
        4 => (0u8..6, 0u8..6, 0usize..3).prop_map(|(a, b, n)| Op::Put(a, b, n)),
        2 => (0u8..6, 0u8..6).prop_map(|(a, b)| Op::Delete(a, b)),
        1 => (0u8..6).prop_map(Op::Drop),
        1 => arb_pairs().prop_map(Op::SyncTo),
    ];
    proptest::collection::vec(op, 1..60)
}

fn counting(fired: &Arc<AtomicUsize>, n: usize) -> Vec<Finalizer> {
    (0..n)
        .map(|_| {
            let fired = fired.clone();
            finalizer(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect()
}

fn sut_pairs(m: &TwoLevelMap<u8, u8>) -> BTreeSet<(u8, u8)> {
    m.pairs().into_iter().collect()
}

fn model_pairs(model: &Model) -> BTreeSet<(u8, u8)> {
    model
        .iter()
        .flat_map(|(k1, layer)| layer.keys().map(move |k2| (*k1, *k2)))
        .collect()
}

// Property: State-machine equivalence against a nested BTreeMap model that
// tracks the number of finalizers attached to each pair.
// Invariants exercised across random operation sequences:
// - Pair sets match the model after every operation.
// - No primary key is left with an empty layer.
// - Every finalizer fires exactly once when its pair is removed by delete,
//   drop_key or sync, and never otherwise.
// - Sync reports exactly the symmetric difference, once per pair.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine(ops in arb_ops()) {
        let fired = Arc::new(AtomicUsize::new(0));
        let sut: TwoLevelMap<u8, u8> = TwoLevelMap::new();
        let mut model = Model::new();
        let mut expected_fired = 0usize;

        for op in ops {
            match op {
                Op::Put(k1, k2, n) => {
                    sut.put(k1, k2, counting(&fired, n));
                    *model.entry(k1).or_default().entry(k2).or_default() += n;
                }
                Op::Delete(k1, k2) => {
                    let removed = model.get_mut(&k1).and_then(|layer| layer.remove(&k2));
                    if model.get(&k1).map(|l| l.is_empty()).unwrap_or(false) {
                        model.remove(&k1);
                    }
                    prop_assert_eq!(sut.delete(&k1, &k2), removed.is_some());
                    expected_fired += removed.unwrap_or(0);
                }
                Op::Drop(k1) => {
                    let removed = model.remove(&k1);
                    prop_assert_eq!(sut.drop_key(&k1), removed.is_some());
                    expected_fired += removed.map(|l| l.values().sum::<usize>()).unwrap_or(0);
                }
                Op::SyncTo(pairs) => {
                    let next: TwoLevelMap<u8, u8> = TwoLevelMap::new();
                    for (k1, k2) in &pairs {
                        next.put(*k1, *k2, []);
                    }
                    let target: BTreeSet<(u8, u8)> = pairs.iter().copied().collect();
                    let before = model_pairs(&model);

                    let mut added = Vec::new();
                    let mut removed = Vec::new();
                    sut.sync(
                        &next,
                        Some(&mut |k1: &u8, k2: &u8| added.push((*k1, *k2))),
                        Some(&mut |k1: &u8, k2: &u8| removed.push((*k1, *k2))),
                    );

                    let added_set: BTreeSet<(u8, u8)> = added.iter().copied().collect();
                    let removed_set: BTreeSet<(u8, u8)> = removed.iter().copied().collect();
                    prop_assert_eq!(added.len(), added_set.len(), "add fires once per pair");
                    prop_assert_eq!(removed.len(), removed_set.len(), "del fires once per pair");
                    let want_added: BTreeSet<(u8, u8)> = target.difference(&before).copied().collect();
                    let want_removed: BTreeSet<(u8, u8)> = before.difference(&target).copied().collect();
                    prop_assert_eq!(&added_set, &want_added);
                    prop_assert_eq!(&removed_set, &want_removed);

                    for (k1, k2) in &removed_set {
                        expected_fired += model[k1][k2];
                    }
                    let mut synced = Model::new();
                    for (k1, k2) in target {
                        let kept = model.get(&k1).and_then(|l| l.get(&k2)).copied().unwrap_or(0);
                        synced.entry(k1).or_default().insert(k2, kept);
                    }
                    model = synced;
                }
            }

            prop_assert_eq!(sut_pairs(&sut), model_pairs(&model));
            prop_assert_eq!(sut.len(), model.len());
            prop_assert_eq!(fired.load(Ordering::SeqCst), expected_fired);
            sut.for_each(|_, layer| {
                assert!(!layer.is_empty(), "empty layer left mapped");
                true
            });
        }

        // Attached-but-unfired finalizers match the model.
        let mut attached = 0usize;
        sut.for_each(|_, layer| {
            layer.for_each(|_, n| {
                attached += n;
                true
            });
            true
        });
        prop_assert_eq!(attached, model.values().flat_map(|l| l.values()).sum::<usize>());
    }
}

// Property: two independently populated maps converge under sync, and the
// target snapshot is left untouched.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_sync_convergence(a_pairs in arb_pairs(), b_pairs in arb_pairs()) {
        let a: TwoLevelMap<u8, u8> = TwoLevelMap::new();
        let b: TwoLevelMap<u8, u8> = TwoLevelMap::new();
        for (k1, k2) in &a_pairs {
            a.put(*k1, *k2, []);
        }
        for (k1, k2) in &b_pairs {
            b.put(*k1, *k2, []);
        }
        let b_before = sut_pairs(&b);

        a.sync(&b, None, None);
        prop_assert_eq!(sut_pairs(&a), sut_pairs(&b));
        prop_assert_eq!(sut_pairs(&b), b_before);
        prop_assert_eq!(a.pair_count(), b.pair_count());
    }
}
