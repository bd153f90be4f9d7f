//! Debug-only reentrancy guard.
//!
//! Detects a thread re-entering a map or layer while a finalizer or callback
//! of that same thread runs under the structure's lock. Such a nested call
//! would otherwise deadlock on the non-reentrant `RwLock`. In debug builds the
//! nested entry panics; in release builds this compiles to a zero-cost no-op.

#[cfg(not(debug_assertions))]
use core::marker::PhantomData;
#[cfg(debug_assertions)]
use parking_lot::Mutex;
#[cfg(debug_assertions)]
use std::thread::{self, ThreadId};

/// Per-instance reentrancy tracker. Embed this in structs to guard public
/// entry-points with `let _g = self.reentrancy.enter();` before locking.
#[derive(Debug, Default)]
pub struct DebugReentrancy {
    // Threads currently inside the structure. Several readers may be inside
    // at once; the same thread may not.
    #[cfg(debug_assertions)]
    inside: Mutex<Vec<ThreadId>>,
}

impl DebugReentrancy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a guarded section. In debug builds, panics if the calling thread
    /// is already inside.
    #[inline]
    pub fn enter(&self) -> ReentrancyGuard<'_> {
        #[cfg(debug_assertions)]
        {
            let me = thread::current().id();
            let nested = {
                let mut inside = self.inside.lock();
                let nested = inside.contains(&me);
                if !nested {
                    inside.push(me);
                }
                nested
            };
            assert!(
                !nested,
                "reentrancy detected: nested entry into data structure from a finalizer or callback"
            );
            return ReentrancyGuard {
                owner: self,
                thread: me,
            };
        }

        #[cfg(not(debug_assertions))]
        {
            return ReentrancyGuard { _z: PhantomData };
        }
    }
}

/// RAII guard returned by `DebugReentrancy::enter`.
pub struct ReentrancyGuard<'a> {
    #[cfg(debug_assertions)]
    owner: &'a DebugReentrancy,
    #[cfg(debug_assertions)]
    thread: ThreadId,
    #[cfg(not(debug_assertions))]
    _z: PhantomData<&'a ()>,
}

impl<'a> Drop for ReentrancyGuard<'a> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            let mut inside = self.owner.inside.lock();
            let pos = inside.iter().position(|t| *t == self.thread);
            debug_assert!(pos.is_some());
            if let Some(pos) = pos {
                inside.swap_remove(pos);
            }
        }
    }
}
