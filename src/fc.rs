//! Flat combining.
//!
//! Every thread that calls into a flat combining [`Mutex`] owns a participant
//! record, created on its first call and linked into the lock's publication
//! list. To run a critical section, a thread writes its closure into its
//! record and competes for the combiner flag. The winner walks the whole list
//! and executes every pending request it finds, its own included, while the
//! other threads wait on their own record until their request has been served.
//!
//! A single thread thus runs many critical sections back to back on a warm
//! cache, instead of the protected data bouncing between cores.
//!
//! Records whose owner stopped calling are unlinked by the combiner every
//! [`cleanup_period`] passes, once they are more than [`cleanup_age`] passes
//! old. Their owner links them back in on its next call.
//!
//! This baseline makes no fairness promise: a thread that keeps resubmitting
//! may be served on every pass. See [`fcf`] and [`fcfpq`] for fair variants.
//!
//! [`cleanup_period`]: crate::Config::cleanup_period
//! [`cleanup_age`]: crate::Config::cleanup_age
//! [`fcf`]: crate::fcf
//! [`fcfpq`]: crate::fcfpq

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::panic::Location;
use core::sync::atomic::Ordering::Relaxed;

use crate::cfg::atomic::AtomicU32;
use crate::config::Config;
use crate::election::{self, Combine, CombinerFlag};
use crate::error::Error;
use crate::lock::{impl_delegate_lock, panic_lock_failed};
use crate::publication::{Node, PublicationList};
use crate::registry::Registry;
use crate::relax::{Relax, Spin};

/// A flat combining lock.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use dlock::fc::spins::Mutex;
///
/// let mutex = Arc::new(Mutex::new(0));
/// let handles: Vec<_> = (0..10)
///     .map(|i| {
///         let mutex = Arc::clone(&mutex);
///         thread::spawn(move || mutex.lock_then(|data| { *data += i; *data }))
///     })
///     .collect();
/// for handle in handles {
///     handle.join().unwrap();
/// }
/// assert_eq!(mutex.lock_then(|data| *data), 45);
/// ```
pub struct Mutex<T, R = Spin> {
    flag: CombinerFlag,
    list: PublicationList<T, ()>,
    pass: AtomicU32,
    config: Config,
    nodes: Registry<Node<T, ()>>,
    data: UnsafeCell<T>,
    marker: PhantomData<R>,
}

// SAFETY: The protected data is only reached through the combining protocol,
// so the lock is as thread safe as `T` is sendable.
unsafe impl<T: Send, R> Send for Mutex<T, R> {}
// SAFETY: Same as above.
unsafe impl<T: Send, R> Sync for Mutex<T, R> {}

impl<T, R> Mutex<T, R> {
    /// Creates a new flat combining lock with the default [`Config`].
    pub fn new(value: T) -> Self {
        Self::with_config(value, Config::new())
    }

    /// Creates a new flat combining lock with the given tuning.
    pub fn with_config(value: T, config: Config) -> Self {
        Self {
            flag: CombinerFlag::new(),
            list: PublicationList::new(),
            pass: AtomicU32::new(0),
            config,
            nodes: Registry::new(),
            data: UnsafeCell::new(value),
            marker: PhantomData,
        }
    }

    /// Consumes this lock, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the lock mutably, no actual locking needs to
    /// take place.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Returns the number of combine passes run so far.
    ///
    /// The counter wraps around on overflow.
    pub fn passes(&self) -> u32 {
        self.pass.load(Relaxed)
    }

    /// Returns the tuning this lock was created with.
    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl<T, R: Relax> Mutex<T, R> {
    /// Runs `f` against the protected data, possibly on another thread, and
    /// returns its output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeAlloc`] if this is the thread's first call and
    /// its participant record could not be allocated.
    ///
    /// # Panics
    ///
    /// Resumes a panic raised by `f`. Panics if called from inside one of
    /// this lock's own delegates.
    #[track_caller]
    pub fn checked_lock_then<F, Ret>(&self, f: F) -> Result<Ret, Error>
    where
        F: FnOnce(&mut T) -> Ret + Send,
        Ret: Send,
    {
        let node = self.nodes.get_or_try(|| Ok(Node::new()))?;
        election::delegate::<Self, R, F, Ret>(self, node, self.config.spin_limit, f)
    }

    /// Runs `f` against the protected data, possibly on another thread, and
    /// returns its output.
    ///
    /// # Panics
    ///
    /// Panics if the participant record could not be allocated, see
    /// [`checked_lock_then`](Self::checked_lock_then).
    #[track_caller]
    pub fn lock_then<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(&mut T) -> Ret + Send,
        Ret: Send,
    {
        let caller = Location::caller();
        self.checked_lock_then(f).unwrap_or_else(|err| panic_lock_failed(&err, caller))
    }
}

impl<T, R> Combine for Mutex<T, R> {
    type Data = T;
    type Ext = ();

    fn list(&self) -> &PublicationList<T, ()> {
        &self.list
    }

    fn flag(&self) -> &CombinerFlag {
        &self.flag
    }

    unsafe fn combine_pass(&self) {
        let pass = self.pass.load(Relaxed).wrapping_add(1);
        self.pass.store(pass, Relaxed);
        // SAFETY: The combiner flag grants exclusive access to the data.
        let data = unsafe { &mut *self.data.get() };
        // SAFETY: Caller holds the combiner flag.
        unsafe {
            self.list.for_each(|node| {
                if node.slot.is_pending() {
                    node.set_age(pass);
                    node.slot.execute(data);
                }
            });
            election::evict_idle(&self.list, pass, &self.config, |_| false);
        }
    }
}

impl_delegate_lock!(Mutex);

impl<T, R> fmt::Debug for Mutex<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("passes", &self.passes())
            .field("combining", &self.flag.is_held())
            .finish_non_exhaustive()
    }
}

/// A flat combining lock whose waiters spin while their request is pending.
pub mod spins {
    /// A [`fc::Mutex`](crate::fc::Mutex) with the [`Spin`](crate::relax::Spin)
    /// relax policy.
    pub type Mutex<T> = super::Mutex<T, crate::relax::Spin>;
}

/// A flat combining lock whose waiters yield on every spin round.
pub mod yields {
    /// A [`fc::Mutex`](crate::fc::Mutex) with the [`Yield`](crate::relax::Yield)
    /// relax policy.
    pub type Mutex<T> = super::Mutex<T, crate::relax::Yield>;
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::mpsc::channel;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::Mutex;
    use crate::election::count_registered;
    use crate::relax::Yield;
    use crate::test::tests;
    use crate::test::{LockData, LockNew};
    use crate::Config;

    impl<T, R> LockNew for Mutex<T, R> {
        type Target = T;

        fn new(value: T) -> Self {
            Self::new(value)
        }
    }

    impl<T, R> LockData for Mutex<T, R> {
        fn into_inner(self) -> T {
            self.into_inner()
        }

        fn get_mut(&mut self) -> &mut T {
            self.get_mut()
        }
    }

    type SpinMutex<T> = Mutex<T>;
    type YieldMutex<T> = Mutex<T, Yield>;

    #[test]
    fn lots_and_lots() {
        tests::lots_and_lots::<SpinMutex<_>>();
        tests::lots_and_lots::<YieldMutex<_>>();
    }

    #[test]
    fn no_lost_results() {
        tests::no_lost_results::<SpinMutex<_>>();
    }

    #[test]
    fn single_executor() {
        tests::single_executor::<SpinMutex<_>>();
    }

    #[test]
    fn smoke() {
        tests::smoke::<SpinMutex<_>>();
    }

    #[test]
    fn borrowed_capture() {
        tests::borrowed_capture::<SpinMutex<_>>();
    }

    #[test]
    fn panic_propagates() {
        tests::panic_propagates::<SpinMutex<_>>();
    }

    #[test]
    fn reentrant_call_panics() {
        tests::reentrant_call_panics::<SpinMutex<_>>();
    }

    #[test]
    fn test_mutex_default() {
        tests::test_mutex_default::<SpinMutex<_>>();
    }

    #[test]
    fn test_mutex_from() {
        tests::test_mutex_from::<SpinMutex<_>>();
    }

    #[test]
    fn test_into_inner() {
        tests::test_into_inner::<SpinMutex<_>>();
    }

    #[test]
    fn test_into_inner_drop() {
        tests::test_into_inner_drop::<SpinMutex<_>>();
    }

    #[test]
    fn test_get_mut() {
        tests::test_get_mut::<SpinMutex<_>>();
    }

    #[test]
    fn test_lock_arc_nested() {
        tests::test_lock_arc_nested::<SpinMutex<_>, SpinMutex<_>>();
    }

    #[test]
    fn test_acquire_more_than_one_lock() {
        tests::test_acquire_more_than_one_lock::<SpinMutex<_>>();
    }

    #[test]
    fn test_lock_arc_access_in_unwind() {
        tests::test_lock_arc_access_in_unwind::<SpinMutex<_>>();
    }

    #[test]
    fn every_first_caller_is_registered() {
        const THREADS: usize = 16;
        // An exited thread's id, and so its record, is handed to the next
        // thread spawned. Keep all of them alive until the list is counted.
        let config = Config::new().cleanup_period(u32::MAX);
        let mutex = Arc::new(SpinMutex::with_config(0_u64, config));
        let start = Arc::new(Barrier::new(THREADS));
        let done = Arc::new(Barrier::new(THREADS + 1));
        let exit = Arc::new(Barrier::new(THREADS + 1));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                let start = Arc::clone(&start);
                let done = Arc::clone(&done);
                let exit = Arc::clone(&exit);
                thread::spawn(move || {
                    start.wait();
                    mutex.lock_then(|data| *data += 1);
                    done.wait();
                    exit.wait();
                })
            })
            .collect();
        done.wait();
        assert_eq!(count_registered(&*mutex), THREADS);
        exit.wait();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(mutex.lock_then(|data| *data), THREADS as u64);
        assert!(mutex.passes() >= 1);
    }

    #[test]
    fn idle_participants_are_unlinked_and_relinked() {
        let config = Config::new().cleanup_period(4).cleanup_age(4);
        let mutex = Arc::new(SpinMutex::with_config(0_u64, config));

        let (to_idle, idle_rx) = channel::<()>();
        let (from_idle, main_rx) = channel::<()>();
        let c_mutex = Arc::clone(&mutex);
        let idle = thread::spawn(move || {
            c_mutex.lock_then(|data| *data += 1);
            from_idle.send(()).unwrap();
            idle_rx.recv().unwrap();
            c_mutex.lock_then(|data| *data += 1);
        });

        main_rx.recv().unwrap();
        assert_eq!(count_registered(&*mutex), 1);
        // Alone on the lock, every call of this thread is one combine pass.
        for _ in 0..12 {
            mutex.lock_then(|data| *data += 1);
        }
        // The idle thread's record went stale and was unlinked, ours is the
        // head of the list and is never unlinked.
        assert_eq!(count_registered(&*mutex), 1);

        to_idle.send(()).unwrap();
        idle.join().unwrap();
        assert_eq!(count_registered(&*mutex), 2);
        assert_eq!(mutex.lock_then(|data| *data), 14);
    }

    #[test]
    fn debug_does_not_touch_data() {
        let mutex = SpinMutex::new(1_u64);
        mutex.lock_then(|data| *data += 1);
        let debug = format!("{mutex:?}");
        assert!(debug.starts_with("Mutex { passes: 1, combining: false"));
    }
}
