//! TwoLevelMap: primary key -> SecondaryLayer, with structural diff-and-sync.

use crate::error::LayerError;
use crate::finalizer::{Finalizer, PendingFinalizers};
use crate::reentrancy::DebugReentrancy;
use crate::secondary_layer::{
    put_entry, sync_entries, take_all_entries, take_entry, Entries, SecondaryLayer, SyncStats,
};
use core::borrow::Borrow;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use hashbrown::HashMap;
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use std::collections::hash_map::RandomState;

/// Initial primary-key capacity used by [`TwoLevelMap::new`].
pub const DEFAULT_CAPACITY: usize = 256;

type Store<K1, K2, S> = HashMap<K1, SecondaryLayer<K2, S>, S>;

/// Concurrency-safe two-level map: each primary key owns a non-empty
/// [`SecondaryLayer`] of secondary keys, and each pair owns its finalizers.
pub struct TwoLevelMap<K1, K2, S = RandomState> {
    store: RwLock<Store<K1, K2, S>>,
    hasher: S,
    reentrancy: DebugReentrancy,
}

/// Read-only view of one primary key's layer, handed out while the root lock
/// is held. Mutation goes through the owning [`TwoLevelMap`] so the
/// no-empty-layer invariant holds.
pub struct LayerView<'a, K2, S = RandomState> {
    layer: &'a SecondaryLayer<K2, S>,
}

impl<'a, K2, S> Clone for LayerView<'a, K2, S> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<'a, K2, S> Copy for LayerView<'a, K2, S> {}

impl<'a, K2, S> LayerView<'a, K2, S>
where
    K2: Eq + Hash + Clone,
    S: BuildHasher + Clone + Default,
{
    pub fn len(&self) -> usize {
        self.layer.len()
    }
    pub fn is_empty(&self) -> bool {
        self.layer.is_empty()
    }

    pub fn contains_key<Q>(&self, key2: &Q) -> bool
    where
        K2: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.layer.contains_key(key2)
    }

    pub fn keys(&self) -> Vec<K2> {
        self.layer.keys()
    }

    /// Visit secondary keys with their finalizer counts until `f` returns false.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K2, usize) -> bool,
    {
        self.layer.for_each(|key2, finalizers| f(key2, finalizers.len()))
    }
}

/// A primary key's layer borrowed out of the map by [`TwoLevelMap::get_layer`].
///
/// Holds the root read lock until dropped. While it is alive, any call on the
/// same map from the holding thread may deadlock, reads such as `len`,
/// `for_each` or `contains` included, as well as `sync` and every mutation.
/// The lock is task-fair, so a writer queued on another thread blocks new
/// readers. Debug builds do not catch this; the
/// reentrancy guard is released by the time `get_layer` returns.
pub struct LayerGuard<'a, K2, S = RandomState> {
    guard: MappedRwLockReadGuard<'a, SecondaryLayer<K2, S>>,
}

impl<'a, K2, S> LayerGuard<'a, K2, S>
where
    K2: Eq + Hash + Clone,
    S: BuildHasher + Clone + Default,
{
    pub fn view(&self) -> LayerView<'_, K2, S> {
        LayerView { layer: &self.guard }
    }

    pub fn len(&self) -> usize {
        self.view().len()
    }
    pub fn is_empty(&self) -> bool {
        self.view().is_empty()
    }

    pub fn contains_key<Q>(&self, key2: &Q) -> bool
    where
        K2: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.view().contains_key(key2)
    }

    pub fn keys(&self) -> Vec<K2> {
        self.view().keys()
    }
}

impl<K1, K2> TwoLevelMap<K1, K2>
where
    K1: Eq + Hash + Clone,
    K2: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, Default::default())
    }
}

impl<K1, K2> Default for TwoLevelMap<K1, K2>
where
    K1: Eq + Hash + Clone,
    K2: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K1, K2, S> TwoLevelMap<K1, K2, S>
where
    K1: Eq + Hash + Clone,
    K2: Eq + Hash + Clone,
    S: BuildHasher + Clone + Default,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(0, hasher)
    }

    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        Self {
            store: RwLock::new(HashMap::with_capacity_and_hasher(
                capacity,
                hasher.clone(),
            )),
            hasher,
            reentrancy: DebugReentrancy::new(),
        }
    }

    fn new_layer(&self) -> SecondaryLayer<K2, S> {
        SecondaryLayer::with_hasher(self.hasher.clone())
    }

    /// Attach `finalizers` to `(key1, key2)`, creating the pair if absent.
    pub fn put<I>(&self, key1: K1, key2: K2, finalizers: I)
    where
        I: IntoIterator<Item = Finalizer>,
    {
        let _g = self.reentrancy.enter();
        let mut store = self.store.write();
        let layer = store.entry(key1).or_insert_with(|| self.new_layer());
        put_entry(layer.entries_mut(), key2, finalizers);
    }

    /// Remove `(key1, key2)`, firing its finalizers. The primary key goes away
    /// with its last secondary key, before any finalizer runs. Returns whether
    /// the pair existed.
    pub fn delete<Q1, Q2>(&self, key1: &Q1, key2: &Q2) -> bool
    where
        K1: Borrow<Q1>,
        K2: Borrow<Q2>,
        Q1: ?Sized + Hash + Eq,
        Q2: ?Sized + Hash + Eq,
    {
        let _g = self.reentrancy.enter();
        let mut store = self.store.write();
        let Some(layer) = store.get_mut(key1) else {
            return false;
        };
        let entries = layer.entries_mut();
        let Some(finalizers) = take_entry(entries, key2) else {
            return false;
        };
        if entries.is_empty() {
            store.remove(key1);
        }
        finalizers.run();
        true
    }

    /// Remove `key1` and every pair under it, firing all their finalizers.
    /// Returns whether `key1` existed.
    pub fn drop_key<Q1>(&self, key1: &Q1) -> bool
    where
        K1: Borrow<Q1>,
        Q1: ?Sized + Hash + Eq,
    {
        let _g = self.reentrancy.enter();
        let mut store = self.store.write();
        match store.remove(key1) {
            Some(mut layer) => {
                let (count, finalizers) = take_all_entries(layer.entries_mut());
                log::trace!("dropped primary key with {} secondary keys", count);
                finalizers.run();
                true
            }
            None => false,
        }
    }

    /// Visit each primary key with a view of its layer until `f` returns false.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K1, LayerView<'_, K2, S>) -> bool,
    {
        let _g = self.reentrancy.enter();
        let store = self.store.read();
        for (key1, layer) in store.iter() {
            if !f(key1, LayerView { layer }) {
                break;
            }
        }
    }

    /// Visit the secondary keys under `key1` until `f` returns false.
    pub fn for_each2<Q1, F>(&self, key1: &Q1, mut f: F)
    where
        K1: Borrow<Q1>,
        Q1: ?Sized + Hash + Eq,
        F: FnMut(&K2) -> bool,
    {
        let _g = self.reentrancy.enter();
        let store = self.store.read();
        if let Some(layer) = store.get(key1) {
            layer.for_each(|key2, _| f(key2));
        }
    }

    /// Borrow `key1`'s layer read-only. The root read lock is held for the
    /// guard's lifetime; see [`LayerGuard`] for what not to call meanwhile.
    pub fn get_layer<Q1>(&self, key1: &Q1) -> Option<LayerGuard<'_, K2, S>>
    where
        K1: Borrow<Q1>,
        Q1: ?Sized + Hash + Eq,
    {
        let _g = self.reentrancy.enter();
        RwLockReadGuard::try_map(self.store.read(), |store| store.get(key1))
            .ok()
            .map(|guard| LayerGuard { guard })
    }

    /// Install `layer` under `key1`, returning the displaced layer without
    /// firing its finalizers; the caller owns it from here on.
    pub fn set_layer(
        &self,
        key1: K1,
        mut layer: SecondaryLayer<K2, S>,
    ) -> Result<Option<SecondaryLayer<K2, S>>, LayerError> {
        if layer.entries_mut().is_empty() {
            return Err(LayerError::EmptyLayer);
        }
        let _g = self.reentrancy.enter();
        let previous = self.store.write().insert(key1, layer);
        log::trace!(
            "installed secondary layer (replaced existing: {})",
            previous.is_some()
        );
        Ok(previous)
    }

    /// Detach `key1`'s layer without firing its finalizers.
    pub fn take_layer<Q1>(&self, key1: &Q1) -> Option<SecondaryLayer<K2, S>>
    where
        K1: Borrow<Q1>,
        Q1: ?Sized + Hash + Eq,
    {
        let _g = self.reentrancy.enter();
        self.store.write().remove(key1)
    }

    pub fn contains<Q1, Q2>(&self, key1: &Q1, key2: &Q2) -> bool
    where
        K1: Borrow<Q1>,
        K2: Borrow<Q2>,
        Q1: ?Sized + Hash + Eq,
        Q2: ?Sized + Hash + Eq,
    {
        let _g = self.reentrancy.enter();
        self.store
            .read()
            .get(key1)
            .map(|layer| layer.entries().contains_key(key2))
            .unwrap_or(false)
    }

    pub fn contains_key<Q1>(&self, key1: &Q1) -> bool
    where
        K1: Borrow<Q1>,
        Q1: ?Sized + Hash + Eq,
    {
        let _g = self.reentrancy.enter();
        self.store.read().contains_key(key1)
    }

    /// Number of primary keys.
    pub fn len(&self) -> usize {
        let _g = self.reentrancy.enter();
        self.store.read().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of (primary, secondary) pairs.
    pub fn pair_count(&self) -> usize {
        let _g = self.reentrancy.enter();
        self.store
            .read()
            .values()
            .map(|layer| layer.entries().len())
            .sum()
    }

    /// Snapshot of every pair, in unspecified order.
    pub fn pairs(&self) -> Vec<(K1, K2)> {
        let _g = self.reentrancy.enter();
        let store = self.store.read();
        let mut out = Vec::new();
        for (key1, layer) in store.iter() {
            out.extend(layer.entries().keys().map(|key2| (key1.clone(), key2.clone())));
        }
        out
    }

    /// Reconcile this map into `next`'s pair set.
    ///
    /// Pairs only in `self` are reported to `on_del` and unlinked; their
    /// finalizers fire after the structural pass, still under the locks, and
    /// also when a callback panics. Pairs only in `next` are materialized here without finalizers
    /// and reported to `on_add`. Callbacks fire once per pair, including pairs
    /// under primary keys that appear or disappear wholesale. `next` is only
    /// read.
    ///
    /// Both root locks are held for the whole pass, taken in address order so
    /// concurrent syncs in opposite directions cannot deadlock. Syncing a map
    /// with itself does nothing.
    pub fn sync(
        &self,
        next: &Self,
        mut on_add: Option<&mut dyn FnMut(&K1, &K2)>,
        mut on_del: Option<&mut dyn FnMut(&K1, &K2)>,
    ) {
        if core::ptr::eq(self, next) {
            return;
        }
        let _g = self.reentrancy.enter();
        let _gn = next.reentrancy.enter();
        let (mut prev_store, next_store) = if (self as *const Self) < (next as *const Self) {
            let prev_store = self.store.write();
            (prev_store, next.store.read())
        } else {
            let next_store = next.store.read();
            (self.store.write(), next_store)
        };

        let empty: Entries<K2, S> = HashMap::with_hasher(self.hasher.clone());
        let mut stats = SyncStats::default();
        let mut pending = PendingFinalizers::new();

        // Primary keys in both snapshots reconcile layer by layer; keys gone
        // from next are diffed against an empty layer and dropped.
        prev_store.retain(|key1, layer| {
            let del = on_del
                .as_deref_mut()
                .map(|f| move |key2: &K2| f(key1, key2));
            match next_store.get(key1) {
                Some(next_layer) => {
                    let add = on_add
                        .as_deref_mut()
                        .map(|f| move |key2: &K2| f(key1, key2));
                    let entries = layer.entries_mut();
                    stats += sync_entries(entries, &next_layer.entries(), add, del, &mut pending);
                    !entries.is_empty()
                }
                None => {
                    stats += sync_entries(
                        layer.entries_mut(),
                        &empty,
                        None::<fn(&K2)>,
                        del,
                        &mut pending,
                    );
                    false
                }
            }
        });

        for (key1, next_layer) in next_store.iter() {
            if prev_store.contains_key(key1) {
                continue;
            }
            let next_entries = next_layer.entries();
            if next_entries.is_empty() {
                continue;
            }
            let add = on_add
                .as_deref_mut()
                .map(|f| move |key2: &K2| f(key1, key2));
            let mut layer = self.new_layer();
            stats += sync_entries(
                layer.entries_mut(),
                &next_entries,
                add,
                None::<fn(&K2)>,
                &mut pending,
            );
            prev_store.insert(key1.clone(), layer);
        }

        log::debug!(
            "synced two-level map: {} pairs added, {} pairs removed",
            stats.added,
            stats.removed
        );
    }
}

impl<K1, K2, S> fmt::Debug for TwoLevelMap<K1, K2, S>
where
    K1: fmt::Debug,
    K2: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.store.read().iter()).finish()
    }
}
