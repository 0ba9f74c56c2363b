//! Fair flat combining with a priority queue.
//!
//! Participants register on a publication list exactly like in [`fc`], but
//! the combiner does not serve requests in list order. Each pass first moves
//! every newly pending request into a binary heap keyed by how much combiner
//! time its owner has consumed so far, then serves requests lowest usage first
//! until the pass runs out of its [`combine_budget`]. Requests left in the
//! heap carry over to the next pass.
//!
//! With [`decay`] enabled, requests that are still queued at the start of a
//! pass have their usage lowered by the running average service time, so a
//! waiter that is repeatedly outbid by lighter participants still climbs the
//! queue.
//!
//! If the heap cannot grow to make room for a request, that request is
//! rejected and its caller gets [`Error::QueueGrowth`].
//!
//! [`fc`]: crate::fc
//! [`combine_budget`]: crate::Config::combine_budget
//! [`decay`]: crate::Config::decay

mod heap;

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::panic::Location;
use core::ptr::NonNull;
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

use self::heap::{Heap, Keyed};

/// Per participant queue state.
#[derive(Debug, Default)]
pub(crate) struct Usage {
    consumed: u64,
    queued: bool,
}

/// A record sitting in the combiner's queue.
struct Queued<T>(NonNull<Node<T, Usage>>);

impl<T> Queued<T> {
    fn usage(&mut self) -> &mut Usage {
        // SAFETY: Entries only live in the queue, which only the combiner
        // touches, and records outlive the lock's queue.
        unsafe { self.0.as_ref().ext() }
    }
}

impl<T> Keyed for Queued<T> {
    fn key(&self) -> u64 {
        // SAFETY: Same as `usage`.
        unsafe { self.0.as_ref().ext().consumed }
    }

    fn set_key(&mut self, key: u64) {
        self.usage().consumed = key;
    }

    fn set_pos(&mut self, pos: Option<usize>) {
        self.usage().queued = pos.is_some();
    }
}

/// A fair flat combining lock that serves the lightest participants first.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use dlock::fcfpq::spins::Mutex;
///
/// let mutex = Arc::new(Mutex::new(0_u64));
/// let handles: Vec<_> = (0..8)
///     .map(|_| {
///         let mutex = Arc::clone(&mutex);
///         thread::spawn(move || {
///             for _ in 0..100 {
///                 mutex.lock_then(|count| *count += 1);
///             }
///         })
///     })
///     .collect();
/// for handle in handles {
///     handle.join().unwrap();
/// }
/// assert_eq!(Arc::try_unwrap(mutex).ok().unwrap().into_inner(), 800);
/// ```
pub struct Mutex<T, R = Spin> {
    flag: CombinerFlag,
    list: PublicationList<T, Usage>,
    pass: AtomicU32,
    queue: UnsafeCell<Heap<Queued<T>>>,
    rejected_at: AtomicUsize,
    clock: Clock,
    stats: UnsafeCell<ServiceStats>,
    config: Config,
    nodes: Registry<Node<T, Usage>>,
    data: UnsafeCell<T>,
    marker: PhantomData<R>,
}

// SAFETY: The protected data, the queue and the statistics are only reached
// through the combining protocol.
unsafe impl<T: Send, R> Send for Mutex<T, R> {}
// SAFETY: Same as above.
unsafe impl<T: Send, R> Sync for Mutex<T, R> {}

impl<T, R> Mutex<T, R> {
    /// Creates a new priority queue combining lock with the default
    /// [`Config`].
    pub fn new(value: T) -> Self {
        Self::with_config(value, Config::new())
    }

    /// Creates a new priority queue combining lock with the given tuning.
    pub fn with_config(value: T, config: Config) -> Self {
        Self::with_queue(value, config, Heap::new())
    }

    fn with_queue(value: T, config: Config, queue: Heap<Queued<T>>) -> Self {
        Self {
            flag: CombinerFlag::new(),
            list: PublicationList::new(),
            pass: AtomicU32::new(0),
            queue: UnsafeCell::new(queue),
            rejected_at: AtomicUsize::new(0),
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

    /// Moves every pending request that is not queued yet into the queue,
    /// rejecting the ones the queue has no room for.
    ///
    /// # Safety
    ///
    /// Caller must hold the combiner flag.
    unsafe fn enqueue_pending(&self, queue: &mut Heap<Queued<T>>) {
        // SAFETY: Caller holds the combiner flag.
        unsafe {
            self.list.for_each(|node| {
                if node.ext().queued || !node.slot.is_pending() {
                    return;
                }
                if let Err(err) = queue.push(Queued(NonNull::from(node))) {
                    if let Error::QueueGrowth { capacity } = err {
                        self.rejected_at.store(capacity, Relaxed);
                    }
                    log::warn!("rejecting delegated request: {err}");
                    node.slot.reject();
                }
            });
        }
    }
}

impl<T, R: Relax> Mutex<T, R> {
    /// Runs `f` against the protected data, possibly on another thread, and
    /// returns its output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeAlloc`] if this is the thread's first call and
    /// its participant record could not be allocated, and
    /// [`Error::QueueGrowth`] if the combiner had no room to queue the
    /// request. In both cases `f` did not run.
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
    /// Panics wherever [`checked_lock_then`](Self::checked_lock_then) would
    /// return an error.
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
    type Ext = Usage;

    fn list(&self) -> &PublicationList<T, Usage> {
        &self.list
    }

    fn flag(&self) -> &CombinerFlag {
        &self.flag
    }

    unsafe fn combine_pass(&self) {
        let pass = self.pass.load(Relaxed).wrapping_add(1);
        self.pass.store(pass, Relaxed);
        // SAFETY: The combiner flag grants exclusive access to the data, the
        // queue and the statistics.
        let (data, queue, stats) =
            unsafe { (&mut *self.data.get(), &mut *self.queue.get(), &mut *self.stats.get()) };

        if self.config.decay && !queue.is_empty() {
            queue.lower_all(stats.average());
        }
        // SAFETY: Caller holds the combiner flag.
        unsafe { self.enqueue_pending(queue) };

        let budget = u64::try_from(self.config.combine_budget.as_nanos()).unwrap_or(u64::MAX);
        let begin = self.clock.now();
        while let Some(mut entry) = queue.pop() {
            // SAFETY: Queued records are linked and hold a pending request
            // that only this combiner may execute.
            let node = unsafe { entry.0.as_ref() };
            let start = self.clock.now();
            // SAFETY: Same as above.
            unsafe {
                node.set_age(pass);
                node.slot.execute(data);
            }
            let end = self.clock.now();
            let elapsed = end.saturating_sub(start);
            stats.record(elapsed);
            let usage = entry.usage();
            usage.consumed = usage.consumed.saturating_add(elapsed);
            if end.saturating_sub(begin) >= budget {
                break;
            }
        }

        // SAFETY: Caller holds the combiner flag.
        unsafe {
            election::evict_idle(&self.list, pass, &self.config, |node| node.ext().queued);
        }
    }

    fn rejection(&self) -> Error {
        Error::QueueGrowth { capacity: self.rejected_at.load(Relaxed) }
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

/// A priority queue combining lock whose waiters spin on their request.
pub mod spins {
    /// A [`fcfpq::Mutex`](crate::fcfpq::Mutex) with the [`Spin`](crate::relax::Spin)
    /// relax policy.
    pub type Mutex<T> = super::Mutex<T, crate::relax::Spin>;
}

/// A priority queue combining lock whose waiters yield on every spin round.
pub mod yields {
    /// A [`fcfpq::Mutex`](crate::fcfpq::Mutex) with the
    /// [`Yield`](crate::relax::Yield) relax policy.
    pub type Mutex<T> = super::Mutex<T, crate::relax::Yield>;
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    use core::ptr::NonNull;

    use super::heap::Heap;
    use super::{Mutex, Queued, Usage};
    use crate::election::count_registered;
    use crate::publication::Node;
    use crate::relax::Yield;
    use crate::test::tests;
    use crate::test::{LockData, LockNew};
    use crate::{Config, Error};

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
    fn zero_budget_still_serves_everyone() {
        let config = Config::new().combine_budget(Duration::ZERO);
        let mutex = Arc::new(SpinMutex::with_config(0_usize, config));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || {
                    for _ in 0..500 {
                        mutex.lock_then(|data| *data += 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(mutex.lock_then(|data| *data), 4_000);
    }

    #[test]
    fn decay_still_serves_everyone() {
        let config = Config::new().decay(true);
        let mutex = Arc::new(SpinMutex::with_config(0_usize, config));
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let mutex = Arc::clone(&mutex);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..200 {
                        mutex.lock_then(|data| {
                            if i == 0 {
                                thread::sleep(Duration::from_micros(10));
                            }
                            *data += 1;
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(mutex.lock_then(|data| *data), 800);
    }

    #[test]
    fn queued_flag_follows_the_queue() {
        let node = Node::<u64, Usage>::new();
        let mut queue = Heap::<Queued<u64>>::new();
        queue.push(Queued(NonNull::from(&node))).unwrap();
        // SAFETY: Nothing else touches the record.
        assert!(unsafe { node.ext() }.queued);
        let _ = queue.pop().unwrap();
        // SAFETY: Same as above.
        assert!(!unsafe { node.ext() }.queued);
    }

    #[test]
    fn rejected_when_queue_cannot_grow() {
        let mutex = SpinMutex::<u32>::with_queue(7, Config::new(), Heap::with_limit(0));
        let err = mutex.checked_lock_then(|data| *data += 1).unwrap_err();
        assert!(matches!(err, Error::QueueGrowth { capacity: 0 }));
        // The rejected closure never ran and the lock is still usable.
        assert_eq!(mutex.into_inner(), 7);
    }

    #[test]
    fn queued_participants_survive_cleanup() {
        let config = Config::new().cleanup_period(1).cleanup_age(0);
        let mutex = Arc::new(SpinMutex::with_config(0_u64, config));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        mutex.lock_then(|data| *data += 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(mutex.lock_then(|data| *data), 4_000);
        assert!(count_registered(&*mutex) >= 1);
    }

    #[test]
    #[ignore = "statistical, run with --ignored"]
    fn fairer_than_plain_flat_combining() {
        let fair = tests::service_spread::<SpinMutex<_>>();
        let plain = tests::service_spread::<crate::fc::Mutex<_>>();
        assert!(fair <= plain, "fair spread {fair} above plain spread {plain}");
    }
}
