//! Finalizers: one-shot cleanup actions attached to a (primary, secondary) pair.

use core::fmt;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};

/// A zero-argument cleanup action, run exactly once when its pair is removed.
///
/// Finalizers run synchronously while the owning structure's lock is held,
/// after the pair has been unlinked. They must not call back into the map or
/// layer that fires them.
pub type Finalizer = Box<dyn FnOnce() + Send + 'static>;

/// Box a closure as a [`Finalizer`].
pub fn finalizer<F>(f: F) -> Finalizer
where
    F: FnOnce() + Send + 'static,
{
    Box::new(f)
}

/// Ordered finalizers owned by a single secondary-key entry.
#[derive(Default)]
pub struct FinalizerList {
    // The mutex only makes the list `Sync` for `Send`-only actions. Adding and
    // running go through `get_mut`/`into_inner`; `len` is the only locker.
    actions: Mutex<Vec<Finalizer>>,
}

impl FinalizerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.actions.lock().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn extend<I>(&mut self, finalizers: I)
    where
        I: IntoIterator<Item = Finalizer>,
    {
        self.actions.get_mut().extend(finalizers);
    }

    /// Move `other`'s actions to the end of this list, keeping their order.
    pub(crate) fn append(&mut self, other: FinalizerList) {
        self.actions.get_mut().extend(other.actions.into_inner());
    }

    /// Consume the list, running every action in attachment order.
    ///
    /// If an action panics, the remaining actions still run before the panic
    /// propagates; a panic from one of those is swallowed.
    pub fn run(self) {
        let mut rest = RunRemaining(self.actions.into_inner().into_iter());
        for action in rest.0.by_ref() {
            action();
        }
    }
}

/// Finalizers unlinked by an operation still in progress. They run when the
/// holder is dropped, so they fire even if a callback panics partway through.
#[derive(Default)]
pub(crate) struct PendingFinalizers(FinalizerList);

impl PendingFinalizers {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, finalizers: FinalizerList) {
        self.0.append(finalizers);
    }
}

impl Drop for PendingFinalizers {
    fn drop(&mut self) {
        let pending = core::mem::take(&mut self.0);
        if std::thread::panicking() {
            // A second panic while unwinding would abort.
            for action in pending.actions.into_inner() {
                let _ = panic::catch_unwind(AssertUnwindSafe(action));
            }
        } else {
            pending.run();
        }
    }
}

// Runs whatever is left when dropped during unwinding.
struct RunRemaining(std::vec::IntoIter<Finalizer>);

impl Drop for RunRemaining {
    fn drop(&mut self) {
        for action in self.0.by_ref() {
            let _ = panic::catch_unwind(AssertUnwindSafe(action));
        }
    }
}

impl fmt::Debug for FinalizerList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinalizerList")
            .field("len", &self.len())
            .finish()
    }
}
