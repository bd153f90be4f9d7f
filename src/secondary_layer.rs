//! SecondaryLayer: leaf map from secondary key to the finalizers attached to it.
//!
//! The entry-level operations are free functions over the raw `Entries` map so
//! that `TwoLevelMap` can drive them through `RwLock::get_mut` while it already
//! holds its own root lock, without taking the layer lock a second time.

use crate::finalizer::{Finalizer, FinalizerList, PendingFinalizers};
use crate::reentrancy::DebugReentrancy;
use core::borrow::Borrow;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use core::ops::AddAssign;
use hashbrown::HashMap;
use parking_lot::{RwLock, RwLockReadGuard};
use std::collections::hash_map::RandomState;

pub(crate) type Entries<K2, S> = HashMap<K2, FinalizerList, S>;

/// Counts of secondary keys materialized and removed by one diff pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct SyncStats {
    pub added: usize,
    pub removed: usize,
}

impl AddAssign for SyncStats {
    fn add_assign(&mut self, rhs: Self) {
        self.added += rhs.added;
        self.removed += rhs.removed;
    }
}

pub(crate) fn put_entry<K2, S, I>(entries: &mut Entries<K2, S>, key2: K2, finalizers: I)
where
    K2: Eq + Hash,
    S: BuildHasher,
    I: IntoIterator<Item = Finalizer>,
{
    entries.entry(key2).or_default().extend(finalizers);
}

/// Unlink `key2`, handing back its finalizers for the caller to run once the
/// structure is consistent again.
pub(crate) fn take_entry<K2, S, Q>(entries: &mut Entries<K2, S>, key2: &Q) -> Option<FinalizerList>
where
    K2: Eq + Hash + Borrow<Q>,
    S: BuildHasher,
    Q: ?Sized + Hash + Eq,
{
    entries.remove(key2)
}

/// Unlink every entry, collecting all finalizers in per-key order.
pub(crate) fn take_all_entries<K2, S>(entries: &mut Entries<K2, S>) -> (usize, FinalizerList) {
    let count = entries.len();
    let mut pending = FinalizerList::new();
    for (_key2, finalizers) in entries.drain() {
        pending.append(finalizers);
    }
    (count, pending)
}

/// Make `prev`'s key set equal to `next`'s.
///
/// Keys only in `prev` are reported to `on_del` and then unlinked; their
/// finalizers move to `pending`. Keys only in `next` are inserted with an
/// empty finalizer list and reported to `on_add`. Finalizers are never copied
/// out of `next`.
pub(crate) fn sync_entries<K2, S, A, D>(
    prev: &mut Entries<K2, S>,
    next: &Entries<K2, S>,
    mut on_add: Option<A>,
    mut on_del: Option<D>,
    pending: &mut PendingFinalizers,
) -> SyncStats
where
    K2: Eq + Hash + Clone,
    S: BuildHasher,
    A: FnMut(&K2),
    D: FnMut(&K2),
{
    let mut stats = SyncStats::default();

    prev.retain(|key2, finalizers| {
        if next.contains_key(key2) {
            return true;
        }
        // Report first: a panicking callback leaves the entry in place.
        if let Some(on_del) = on_del.as_mut() {
            on_del(key2);
        }
        pending.push(core::mem::take(finalizers));
        stats.removed += 1;
        false
    });

    for key2 in next.keys() {
        if prev.contains_key(key2) {
            continue;
        }
        prev.insert(key2.clone(), FinalizerList::new());
        if let Some(on_add) = on_add.as_mut() {
            on_add(key2);
        }
        stats.added += 1;
    }

    stats
}

/// Concurrency-safe map from secondary key to its ordered finalizers.
pub struct SecondaryLayer<K2, S = RandomState> {
    entries: RwLock<Entries<K2, S>>,
    reentrancy: DebugReentrancy,
}

impl<K2> SecondaryLayer<K2>
where
    K2: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::with_hasher(Default::default())
    }
}

impl<K2> Default for SecondaryLayer<K2>
where
    K2: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K2, S> SecondaryLayer<K2, S>
where
    K2: Eq + Hash + Clone,
    S: BuildHasher + Clone + Default,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_hasher(hasher)),
            reentrancy: DebugReentrancy::new(),
        }
    }

    /// Insert `key2` if absent, then append `finalizers` to its list.
    pub fn put<I>(&self, key2: K2, finalizers: I)
    where
        I: IntoIterator<Item = Finalizer>,
    {
        let _g = self.reentrancy.enter();
        put_entry(&mut self.entries.write(), key2, finalizers);
    }

    /// Remove `key2`, then fire its finalizers in order under the layer lock.
    /// Returns false when the key was absent.
    pub fn delete<Q>(&self, key2: &Q) -> bool
    where
        K2: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let _g = self.reentrancy.enter();
        let mut entries = self.entries.write();
        match take_entry(&mut entries, key2) {
            Some(finalizers) => {
                finalizers.run();
                true
            }
            None => false,
        }
    }

    /// Visit every entry under the read lock until `f` returns false.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K2, &FinalizerList) -> bool,
    {
        let _g = self.reentrancy.enter();
        for (key2, finalizers) in self.entries.read().iter() {
            if !f(key2, finalizers) {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        let _g = self.reentrancy.enter();
        self.entries.read().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_key<Q>(&self, key2: &Q) -> bool
    where
        K2: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let _g = self.reentrancy.enter();
        self.entries.read().contains_key(key2)
    }

    /// Snapshot of the secondary keys, in unspecified order.
    pub fn keys(&self) -> Vec<K2> {
        let _g = self.reentrancy.enter();
        self.entries.read().keys().cloned().collect()
    }

    /// Fire every finalizer of every key and leave the layer empty.
    pub fn finalize(&self) {
        let _g = self.reentrancy.enter();
        let mut entries = self.entries.write();
        let (count, pending) = take_all_entries(&mut entries);
        log::trace!("finalized secondary layer with {} keys", count);
        pending.run();
    }

    /// Reconcile this layer into `next`'s key set.
    ///
    /// Keys missing from `next` are reported to `on_del` and unlinked; their
    /// finalizers run once the pass is complete, still under both locks, and
    /// also if a callback panics. Keys missing from `self` are added with no
    /// finalizers and reported to `on_add`. `next` is only read. Both locks
    /// are taken in address order; syncing a layer with itself does nothing.
    pub fn sync(
        &self,
        next: &Self,
        on_add: Option<&mut dyn FnMut(&K2)>,
        on_del: Option<&mut dyn FnMut(&K2)>,
    ) {
        if core::ptr::eq(self, next) {
            return;
        }
        let _g = self.reentrancy.enter();
        let _gn = next.reentrancy.enter();
        let (mut prev_entries, next_entries) = if (self as *const Self) < (next as *const Self) {
            let prev_entries = self.entries.write();
            (prev_entries, next.entries.read())
        } else {
            let next_entries = next.entries.read();
            (self.entries.write(), next_entries)
        };
        let mut pending = PendingFinalizers::new();
        let stats = sync_entries(&mut prev_entries, &next_entries, on_add, on_del, &mut pending);
        log::debug!(
            "synced secondary layer: {} keys added, {} keys removed",
            stats.added,
            stats.removed
        );
    }

    pub(crate) fn entries_mut(&mut self) -> &mut Entries<K2, S> {
        self.entries.get_mut()
    }

    pub(crate) fn entries(&self) -> RwLockReadGuard<'_, Entries<K2, S>> {
        self.entries.read()
    }
}

impl<K2, S> fmt::Debug for SecondaryLayer<K2, S>
where
    K2: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.read().iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finalizer::finalizer;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn counting(counter: &Arc<AtomicUsize>) -> Finalizer {
        let counter = counter.clone();
        finalizer(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn layer_of(keys: &[&'static str]) -> SecondaryLayer<&'static str> {
        let layer = SecondaryLayer::new();
        for k in keys {
            layer.put(*k, []);
        }
        layer
    }

    fn key_set(layer: &SecondaryLayer<&'static str>) -> BTreeSet<&'static str> {
        layer.keys().into_iter().collect()
    }

    /// Invariant: repeated `put` keeps one entry per key and appends finalizers.
    #[test]
    fn put_accumulates_finalizers() {
        let fired = Arc::new(AtomicUsize::new(0));
        let layer = SecondaryLayer::new();
        layer.put("a", [counting(&fired)]);
        layer.put("a", []);
        layer.put("a", [counting(&fired), counting(&fired)]);
        assert_eq!(layer.len(), 1);

        let mut seen = 0;
        layer.for_each(|k, finalizers| {
            assert_eq!(*k, "a");
            seen = finalizers.len();
            true
        });
        assert_eq!(seen, 3);
        assert_eq!(fired.load(Ordering::SeqCst), 0, "put never fires");
    }

    /// Invariant: `delete` fires finalizers once, in attachment order; a second
    /// delete reports absence and fires nothing.
    #[test]
    fn delete_fires_in_order_once() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (o1, o2) = (order.clone(), order.clone());
        let layer = SecondaryLayer::new();
        layer.put(
            "k".to_string(),
            [
                finalizer(move || o1.lock().unwrap().push("f1")),
                finalizer(move || o2.lock().unwrap().push("f2")),
            ],
        );

        assert!(layer.delete("k"));
        assert_eq!(*order.lock().unwrap(), vec!["f1", "f2"]);
        assert!(!layer.delete("k"));
        assert_eq!(order.lock().unwrap().len(), 2);
        assert!(layer.is_empty());
    }

    /// Invariant: a panicking finalizer leaves the key unlinked, and the
    /// finalizers after it in the list still run.
    #[test]
    fn panicking_finalizer_still_unlinks() {
        let fired = Arc::new(AtomicUsize::new(0));
        let layer = SecondaryLayer::new();
        layer.put("k", [finalizer(|| panic!("cleanup failed")), counting(&fired)]);

        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            layer.delete("k");
        }));
        assert!(res.is_err());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!layer.contains_key("k"));
        assert!(!layer.delete("k"));
    }

    /// Invariant: `for_each` stops as soon as the callback returns false.
    #[test]
    fn for_each_early_termination() {
        let layer = layer_of(&["a", "b", "c", "d"]);
        let mut visits = 0;
        layer.for_each(|_, _| {
            visits += 1;
            visits < 2
        });
        assert_eq!(visits, 2);
    }

    /// Invariant: `finalize` fires everything once and empties the layer.
    #[test]
    fn finalize_clears_and_fires_all() {
        let fired = Arc::new(AtomicUsize::new(0));
        let layer = SecondaryLayer::new();
        layer.put(1u32, [counting(&fired)]);
        layer.put(2u32, [counting(&fired), counting(&fired)]);
        layer.put(3u32, []);

        layer.finalize();
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(layer.is_empty());

        layer.finalize();
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    /// Invariant: after `sync`, prev's key set equals next's; callbacks see
    /// exactly the symmetric difference; next is untouched.
    #[test]
    fn sync_converges_and_reports_differences() {
        let prev = layer_of(&["a", "b", "c"]);
        let next = layer_of(&["b", "c", "d", "e"]);
        let mut added = BTreeSet::new();
        let mut removed = BTreeSet::new();

        prev.sync(
            &next,
            Some(&mut |k: &&'static str| {
                added.insert(*k);
            }),
            Some(&mut |k: &&'static str| {
                removed.insert(*k);
            }),
        );

        assert_eq!(key_set(&prev), key_set(&next));
        assert_eq!(added, BTreeSet::from(["d", "e"]));
        assert_eq!(removed, BTreeSet::from(["a"]));
        assert_eq!(key_set(&next), BTreeSet::from(["b", "c", "d", "e"]));
    }

    /// Invariant: keys removed by `sync` fire their finalizers; keys that
    /// survive keep theirs; added keys do not inherit next's finalizers.
    #[test]
    fn sync_finalizes_removed_keys_only() {
        let fired = Arc::new(AtomicUsize::new(0));
        let prev = SecondaryLayer::new();
        prev.put("gone", [counting(&fired)]);
        prev.put("kept", [counting(&fired)]);
        let next = SecondaryLayer::new();
        next.put("kept", []);
        next.put("new", [counting(&fired)]);

        prev.sync(&next, None, None);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let mut lens = Vec::new();
        prev.for_each(|k, f| {
            lens.push((*k, f.len()));
            true
        });
        lens.sort();
        assert_eq!(lens, vec![("kept", 1), ("new", 0)]);

        // Next keeps ownership of its own finalizers.
        next.finalize();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    /// Invariant: syncing a layer with itself is a no-op.
    #[test]
    fn sync_with_self_is_noop() {
        let layer = layer_of(&["a", "b"]);
        let mut calls = 0;
        layer.sync(
            &layer,
            Some(&mut |_: &&'static str| calls += 1),
            None,
        );
        assert_eq!(calls, 0);
        assert_eq!(layer.len(), 2);
    }

    /// Invariant: two layers synced toward each other from two threads at once
    /// do not deadlock; lock acquisition follows address order.
    #[test]
    fn opposite_direction_syncs_do_not_deadlock() {
        let a = Arc::new(layer_of(&["a", "shared"]));
        let b = Arc::new(layer_of(&["b", "shared"]));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let (a, b) = (a.clone(), b.clone());
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        if i % 2 == 0 {
                            a.sync(&b, None, None);
                        } else {
                            b.sync(&a, None, None);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("sync thread");
        }
        assert_eq!(key_set(&a), key_set(&b));
    }

    /// Invariant (debug-only): a finalizer re-entering its own layer panics
    /// instead of deadlocking on the layer lock.
    #[cfg(debug_assertions)]
    #[test]
    fn reentrant_finalizer_panics() {
        let layer = Arc::new(SecondaryLayer::new());
        let inner = layer.clone();
        layer.put(
            "k",
            [finalizer(move || {
                let _ = inner.len();
            })],
        );
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            layer.delete("k");
        }));
        assert!(res.is_err(), "expected reentrancy to panic in debug builds");
        assert!(layer.is_empty(), "layer stays usable after the panic");
    }
}
