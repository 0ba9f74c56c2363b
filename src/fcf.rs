//! Fair flat combining with banning.
//!
//! Works like [`fc`], except that the combiner times every critical section
//! it executes and bans the served participant for a while afterwards. The
//! ban is proportional to the time the critical section took multiplied by
//! the number of threads currently waiting on the lock, minus the running
//! average critical section time. While banned, a participant's new requests
//! stay pending and are skipped by combine passes, which gives the other
//! waiters a proportionally larger share of the combiner.
//!
//! Bans are time based and thus always expire, so a banned request is served
//! eventually. The thread holding it keeps taking part in combiner election
//! in the meantime.
//!
//! [`fc`]: crate::fc

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::panic::Location;
use core::sync::atomic::Ordering::Relaxed;

use crate::cfg::atomic::{AtomicU32, AtomicUsize};
use crate::config::Config;
use crate::election::{self, Combine, CombinerFlag};
use crate::error::Error;
use crate::fairness::{Clock, ServiceStats};
use crate::lock::{impl_delegate_lock, panic_lock_failed};
use crate::publication::{Node, PublicationList};
use crate::registry::Registry;
use crate::relax::{Relax, Spin};

/// Per participant ban state.
#[derive(Debug, Default)]
pub(crate) struct Ban {
    until: u64,
}

/// A fair flat combining lock that bans recently served participants.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use dlock::fcf::spins::Mutex;
///
/// let mutex = Arc::new(Mutex::new(Vec::new()));
/// let handles: Vec<_> = (0..4)
///     .map(|i| {
///         let mutex = Arc::clone(&mutex);
///         thread::spawn(move || mutex.lock_then(|log| log.push(i)))
///     })
///     .collect();
/// for handle in handles {
///     handle.join().unwrap();
/// }
/// let mut log = Arc::try_unwrap(mutex).ok().unwrap().into_inner();
/// log.sort_unstable();
/// assert_eq!(log, [0, 1, 2, 3]);
/// ```
pub struct Mutex<T, R = Spin> {
    flag: CombinerFlag,
    list: PublicationList<T, Ban>,
    pass: AtomicU32,
    waiting: AtomicUsize,
    clock: Clock,
    stats: UnsafeCell<ServiceStats>,
    config: Config,
    nodes: Registry<Node<T, Ban>>,
    data: UnsafeCell<T>,
    marker: PhantomData<R>,
}

// SAFETY: The protected data and the service statistics are only reached
// through the combining protocol.
unsafe impl<T: Send, R> Send for Mutex<T, R> {}
// SAFETY: Same as above.
unsafe impl<T: Send, R> Sync for Mutex<T, R> {}

impl<T, R> Mutex<T, R> {
    /// Creates a new fair flat combining lock with the default [`Config`].
    pub fn new(value: T) -> Self {
        Self::with_config(value, Config::new())
    }

    /// Creates a new fair flat combining lock with the given tuning.
    pub fn with_config(value: T, config: Config) -> Self {
        Self {
            flag: CombinerFlag::new(),
            list: PublicationList::new(),
            pass: AtomicU32::new(0),
            waiting: AtomicUsize::new(0),
            clock: Clock::new(),
            stats: UnsafeCell::new(ServiceStats::default()),
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
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Returns the number of combine passes run so far.
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
        let _waiting = Waiting::enter(&self.waiting);
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
    type Ext = Ban;

    fn list(&self) -> &PublicationList<T, Ban> {
        &self.list
    }

    fn flag(&self) -> &CombinerFlag {
        &self.flag
    }

    unsafe fn combine_pass(&self) {
        let pass = self.pass.load(Relaxed).wrapping_add(1);
        self.pass.store(pass, Relaxed);
        let waiting = self.waiting.load(Relaxed);
        // SAFETY: The combiner flag grants exclusive access to the data and
        // to the statistics.
        let (data, stats) = unsafe { (&mut *self.data.get(), &mut *self.stats.get()) };
        // SAFETY: Caller holds the combiner flag.
        unsafe {
            self.list.for_each(|node| {
                if !node.slot.is_pending() {
                    return;
                }
                node.set_age(pass);
                let ban = node.ext();
                let begin = self.clock.now();
                if ban.until > begin {
                    return;
                }
                node.slot.execute(data);
                let end = self.clock.now();
                let elapsed = end.saturating_sub(begin);
                stats.record(elapsed);
                ban.until = stats.ban_until(end, elapsed, waiting);
            });
            election::evict_idle(&self.list, pass, &self.config, |_| false);
        }
    }
}

impl_delegate_lock!(Mutex);

/// Counts the caller among the waiters until dropped, also when unwinding.
struct Waiting<'a>(&'a AtomicUsize);

impl<'a> Waiting<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Relaxed);
        Self(count)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Relaxed);
    }
}

impl<T, R> fmt::Debug for Mutex<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("passes", &self.passes())
            .field("waiting", &self.waiting.load(Relaxed))
            .field("combining", &self.flag.is_held())
            .finish_non_exhaustive()
    }
}

/// A fair flat combining lock whose waiters spin on their request.
pub mod spins {
    /// A [`fcf::Mutex`](crate::fcf::Mutex) with the [`Spin`](crate::relax::Spin)
    /// relax policy.
    pub type Mutex<T> = super::Mutex<T, crate::relax::Spin>;
}

/// A fair flat combining lock whose waiters yield on every spin round.
pub mod yields {
    /// A [`fcf::Mutex`](crate::fcf::Mutex) with the
    /// [`Yield`](crate::relax::Yield) relax policy.
    pub type Mutex<T> = super::Mutex<T, crate::relax::Yield>;
}

#[cfg(all(not(loom), test))]
mod test {
    use core::sync::atomic::Ordering::Relaxed;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    use super::Mutex;
    use crate::relax::Yield;
    use crate::test::tests;
    use crate::test::{LockData, LockNew};

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
    fn test_lock_arc_access_in_unwind() {
        tests::test_lock_arc_access_in_unwind::<SpinMutex<_>>();
    }

    #[test]
    fn banned_requests_are_served_eventually() {
        // Long critical sections under contention earn long bans. Every
        // request must still complete once its ban expires.
        const THREADS: usize = 4;
        const ITERS: usize = 20;
        let mutex = Arc::new(SpinMutex::new(0_usize));
        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..ITERS {
                        mutex.lock_then(|data| {
                            thread::sleep(Duration::from_micros(50));
                            *data += 1;
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(mutex.lock_then(|data| *data), THREADS * ITERS);
    }

    #[test]
    fn waiting_is_balanced() {
        let mutex = SpinMutex::new(0);
        mutex.lock_then(|data| *data += 1);
        let unwound = panic::catch_unwind(AssertUnwindSafe(|| {
            mutex.lock_then(|data| assert_eq!(*data, 0, "unbalanced"));
        }));
        assert!(unwound.is_err());
        assert_eq!(mutex.waiting.load(Relaxed), 0);
    }

    #[test]
    fn fresh_participants_are_not_banned() {
        // Nobody else waits, so the ban of the only participant is at most
        // the time it took, and never holds back its next call for long.
        let mutex = SpinMutex::new(0_u64);
        for _ in 0..100 {
            mutex.lock_then(|data| *data += 1);
        }
        assert_eq!(mutex.lock_then(|data| *data), 100);
        assert!(mutex.passes() >= 101);
    }

    #[test]
    #[ignore = "statistical, run with --ignored"]
    fn fairer_than_plain_flat_combining() {
        let fair = tests::service_spread::<SpinMutex<_>>();
        let plain = tests::service_spread::<crate::fc::Mutex<_>>();
        assert!(fair <= plain, "fair spread {fair} above plain spread {plain}");
    }
}
