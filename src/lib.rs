//! dumbmap2d: a concurrency-safe two-level map whose (primary, secondary)
//! pairs carry one-shot finalizers, with a structural diff-and-sync between
//! two independently built snapshots.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: keep two snapshots of a keyed set-of-sets in step, reporting the
//!   per-pair additions and removals and running cleanup for removed pairs.
//! - Layers:
//!   - SecondaryLayer<K2, S>: leaf map from secondary key to an ordered
//!     `FinalizerList`, guarded by its own `RwLock`. Supports put, delete
//!     (fires finalizers), enumeration, bulk finalize and a layer diff.
//!   - TwoLevelMap<K1, K2, S>: root map from primary key to an owned
//!     SecondaryLayer, guarded by one `RwLock`. Put/delete/drop, two-level
//!     enumeration, layer lookup/replacement and the root diff that delegates
//!     per primary key to the layer diff.
//!
//! Constraints
//! - Every operation is synchronous; no background work, no timeouts.
//! - A primary key never maps to an empty layer: deleting the last secondary
//!   key removes the primary key, and empty layers cannot be installed.
//! - Finalizers run exactly once, in attachment order per pair, when the pair
//!   is removed by `delete`, `drop_key`, `finalize` or `sync`. Dropping a map
//!   or a detached layer does not run them.
//! - A pair is unlinked, and an emptied primary key pruned, before its
//!   finalizers run. A panicking finalizer does not stop the others of the
//!   same removal. `sync` runs the finalizers it collected after the pass,
//!   also when a callback panics.
//! - Sync callbacks fire once per secondary-key change, never per primary key,
//!   including when a whole primary key appears or disappears.
//!
//! Locking
//! - Mutating root operations take only the root lock and reach layers through
//!   `RwLock::get_mut`.
//! - Read-only root operations (`for_each2`, `contains`, `pair_count`,
//!   `pairs`, `LayerView` and the target side of `sync`) take a layer read
//!   lock while holding the root lock. It is never contended, since a mapped
//!   layer only changes under the root write lock.
//! - A `LayerGuard` holds the root read lock. Any call on the same map from
//!   that thread may deadlock while it lives, because the lock is task-fair.
//! - `sync` holds the write lock of the map being updated and the read lock
//!   of the target for the full pass. The two are taken in address order so
//!   concurrent syncs between the same pair in opposite directions cannot
//!   deadlock.
//!
//! Reentrancy policy
//! - Finalizers and callbacks run while locks are held. They must not call
//!   back into the structure that invoked them. Debug builds detect this with
//!   a per-instance guard and panic instead of deadlocking; release builds
//!   do not check.
//!
//! Notes and non-goals
//! - In-process and in-memory only; no persistence.
//! - Enumeration order is unspecified at both levels.
//! - There are no primary-key-only entries.

mod error;
mod finalizer;
mod reentrancy;
mod secondary_layer;
mod two_level_map;
mod two_level_map_proptest;

// Public surface
pub use error::LayerError;
pub use finalizer::{finalizer, Finalizer, FinalizerList};
pub use reentrancy::{DebugReentrancy, ReentrancyGuard};
pub use secondary_layer::SecondaryLayer;
pub use two_level_map::{LayerGuard, LayerView, TwoLevelMap, DEFAULT_CAPACITY};
