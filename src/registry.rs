//! Per-thread, per-lock participant records.
//!
//! Each lock owns a [`Registry`] keyed by thread. A thread's record is created
//! the first time it calls into that lock, reused by every later call, and
//! freed together with the lock. Records are boxed so their address stays
//! stable while other threads hold pointers to them.

use core::fmt;
use core::panic::Location;
use core::ptr::NonNull;
use core::sync::atomic::Ordering::Relaxed;
use std::alloc::{self, Layout};

use thread_local::ThreadLocal;

use crate::cfg::atomic::AtomicBool;
use crate::error::Error;

/// Moves `value` into a new heap allocation, reporting allocation failure as
/// an error instead of aborting.
pub(crate) fn try_box<T>(value: T) -> Result<Box<T>, Error> {
    let layout = Layout::new::<T>();
    if layout.size() == 0 {
        return Ok(Box::new(value));
    }
    // SAFETY: The layout has a non-zero size.
    let ptr = unsafe { alloc::alloc(layout) }.cast::<T>();
    let Some(ptr) = NonNull::new(ptr) else {
        return Err(Error::NodeAlloc { size: layout.size() });
    };
    // SAFETY: The pointer was just allocated with the layout of `T`, so it
    // is valid for writes and may be owned by a `Box`.
    unsafe {
        ptr.as_ptr().write(value);
        Ok(Box::from_raw(ptr.as_ptr()))
    }
}

/// Thread keyed storage of boxed participant records.
///
/// Records are keyed by thread id, and ids of exited threads are recycled.
/// A record is never freed before the registry, and a later thread that
/// inherits the id takes over the record instead of allocating a new one.
pub(crate) struct Registry<N: Send> {
    nodes: ThreadLocal<Box<N>>,
}

impl<N: Send> Registry<N> {
    /// Creates an empty registry.
    pub(crate) fn new() -> Self {
        Self { nodes: ThreadLocal::new() }
    }

    /// Returns the calling thread's record, allocating it with `init` on the
    /// first call.
    pub(crate) fn get_or_try<F>(&self, init: F) -> Result<&N, Error>
    where
        F: FnOnce() -> Result<N, Error>,
    {
        self.nodes.get_or_try(|| init().and_then(try_box)).map(|node| &**node)
    }

    /// Iterates over every thread's record.
    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut N> {
        self.nodes.iter_mut().map(|node| &mut **node)
    }
}

impl<N: Send> fmt::Debug for Registry<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

/// A flag set while the owning thread is inside a call on the lock.
///
/// Delegates must not call back into the lock that is running them: the
/// thread would wait for a request that only it can serve.
pub(crate) struct Entered(AtomicBool);

impl Entered {
    pub(crate) fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Marks the owner as inside a call until the returned guard drops.
    ///
    /// # Panics
    ///
    /// Panics if the owner is already inside a call on the same lock.
    #[track_caller]
    pub(crate) fn enter(&self) -> EnteredGuard<'_> {
        // Only the owning thread touches this flag.
        if self.0.swap(true, Relaxed) {
            panic_reentrant(Location::caller());
        }
        EnteredGuard(&self.0)
    }
}

/// Clears the entered flag, also when unwinding.
pub(crate) struct EnteredGuard<'a>(&'a AtomicBool);

impl Drop for EnteredGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Relaxed);
    }
}

/// Panics the thread with a message pointing to the panic location.
#[inline(never)]
#[cold]
pub(crate) fn panic_reentrant(caller: &Location<'static>) -> ! {
    panic!("lock called again from inside one of its own delegates, conflict at: {caller}")
}

#[cfg(all(not(loom), test))]
mod test {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::Arc;
    use std::thread;

    use super::{try_box, Entered, Registry};

    #[test]
    fn try_box_moves_value() {
        let boxed = try_box([7_u64; 8]).unwrap();
        assert_eq!(*boxed, [7; 8]);
        let unit = try_box(()).unwrap();
        assert_eq!(*unit, ());
    }

    #[test]
    fn one_record_per_thread() {
        let registry = Arc::new(Registry::<u32>::new());
        let mine = registry.get_or_try(|| Ok(1)).unwrap() as *const u32;
        let again = registry.get_or_try(|| Ok(2)).unwrap() as *const u32;
        assert_eq!(mine, again);

        let c_registry = Arc::clone(&registry);
        let theirs = thread::spawn(move || *c_registry.get_or_try(|| Ok(3)).unwrap())
            .join()
            .unwrap();
        assert_eq!(theirs, 3);

        let mut registry = Arc::into_inner(registry).unwrap();
        let mut values: Vec<_> = registry.iter_mut().map(|v| *v).collect();
        values.sort_unstable();
        assert_eq!(values, [1, 3]);
    }

    #[test]
    fn entered_rejects_nesting() {
        let entered = Entered::new();
        let guard = entered.enter();
        let nested = panic::catch_unwind(AssertUnwindSafe(|| drop(entered.enter())));
        assert!(nested.is_err());
        drop(guard);
        drop(entered.enter());
    }
}
