//! CC-Synch combining.
//!
//! Requests form an implicit queue, much like the waiters of an MCS lock. The
//! queue always ends in an empty node, its tail. A caller swaps its own spare
//! node in as the new tail, writes its request into the node it got back and
//! links that node to the spare. It then waits on the node it got back.
//!
//! A waiter is woken either because its request was executed, in which case
//! it just returns the output, or because it was handed the combiner role. A
//! combiner walks the queue from its own node, executing requests and waking
//! their owners, until it reaches the tail or has served [`hop_bound`]
//! requests. It then wakes the owner of the next unserved node as the new
//! combiner.
//!
//! Nodes travel between threads: after a call, the calling thread keeps the
//! node it wrote its request into as its spare for the next call. The lock
//! frees every node when it is dropped.
//!
//! [`hop_bound`]: crate::Config::hop_bound

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::panic::Location;
use core::ptr;
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use crossbeam_utils::CachePadded;

use crate::cfg::atomic::{AtomicBool, AtomicPtr, AtomicUsize};
use crate::config::Config;
use crate::delegate::{RawJob, Task};
use crate::error::Error;
use crate::lock::{impl_delegate_lock, panic_lock_failed};
use crate::registry::{try_box, Entered, Registry};
use crate::relax::{self, Relax, Spin};

type NodePtr<T> = *mut CachePadded<Node<T>>;

struct Node<T> {
    job: UnsafeCell<Option<RawJob<T>>>,
    wait: AtomicBool,
    completed: AtomicBool,
    next: AtomicPtr<CachePadded<Node<T>>>,
}

impl<T> Node<T> {
    fn new() -> Self {
        Self {
            job: UnsafeCell::new(None),
            wait: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// A thread's spare node.
struct Local<T> {
    node: AtomicPtr<CachePadded<Node<T>>>,
    entered: Entered,
}

/// Every node of a lock: one per participating thread plus the tail.
struct Nodes<T> {
    tail: CachePadded<AtomicPtr<CachePadded<Node<T>>>>,
    locals: Registry<Local<T>>,
}

impl<T> Nodes<T> {
    fn new() -> Self {
        let tail = Box::into_raw(Box::new(CachePadded::new(Node::new())));
        Self { tail: CachePadded::new(AtomicPtr::new(tail)), locals: Registry::new() }
    }

    fn local(&self) -> Result<&Local<T>, Error> {
        self.locals.get_or_try(|| {
            let spare = try_box(CachePadded::new(Node::new()))?;
            Ok(Local { node: AtomicPtr::new(Box::into_raw(spare)), entered: Entered::new() })
        })
    }
}

impl<T> Drop for Nodes<T> {
    fn drop(&mut self) {
        // With no call in flight, the tail and the spares are exactly the
        // nodes ever allocated, each owned once.
        let tail = self.tail.load(Relaxed);
        // SAFETY: Every node was leaked from a box and is freed only here.
        unsafe { drop(Box::from_raw(tail)) };
        for local in self.locals.iter_mut() {
            // SAFETY: Same as above.
            unsafe { drop(Box::from_raw(local.node.load(Relaxed))) };
        }
    }
}

/// A CC-Synch combining lock.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use dlock::ccsynch::spins::Mutex;
///
/// let mutex = Arc::new(Mutex::new(String::new()));
/// let handles: Vec<_> = (0..3)
///     .map(|_| {
///         let mutex = Arc::clone(&mutex);
///         thread::spawn(move || mutex.lock_then(|text| text.push('x')))
///     })
///     .collect();
/// for handle in handles {
///     handle.join().unwrap();
/// }
/// assert_eq!(mutex.lock_then(|text| text.len()), 3);
/// ```
pub struct Mutex<T, R = Spin> {
    nodes: Nodes<T>,
    max_tenure: AtomicUsize,
    config: Config,
    data: UnsafeCell<T>,
    marker: PhantomData<R>,
}

// SAFETY: The protected data is only reached by the current combiner.
unsafe impl<T: Send, R> Send for Mutex<T, R> {}
// SAFETY: Same as above.
unsafe impl<T: Send, R> Sync for Mutex<T, R> {}

impl<T, R> Mutex<T, R> {
    /// Creates a new CC-Synch lock with the default [`Config`].
    pub fn new(value: T) -> Self {
        Self::with_config(value, Config::new())
    }

    /// Creates a new CC-Synch lock with the given tuning.
    pub fn with_config(value: T, config: Config) -> Self {
        Self {
            nodes: Nodes::new(),
            max_tenure: AtomicUsize::new(0),
            config,
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

    /// Returns the largest number of requests a single combiner has served
    /// in one tenure. Never exceeds the configured hop bound.
    pub fn max_tenure(&self) -> usize {
        self.max_tenure.load(Relaxed)
    }

    /// Returns the tuning this lock was created with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Serves requests starting at `cur` and hands the combiner role to the
    /// first node left unserved.
    ///
    /// # Safety
    ///
    /// Caller must have been woken on `cur` without it being completed.
    unsafe fn combine(&self, cur: &Node<T>) {
        // SAFETY: Being woken without completion makes us the only combiner.
        let data = unsafe { &mut *self.data.get() };
        let mut tmp = cur;
        let mut served = 0;
        while served < self.config.hop_bound {
            // Read the link before waking the owner, who may reuse the node
            // right after.
            let next = tmp.next.load(Acquire);
            // SAFETY: Linked nodes are kept alive by the lock.
            let Some(next) = (unsafe { next.as_ref() }) else { break };
            // SAFETY: The owner published the job before linking `next`, and
            // waits until `wait` is cleared.
            if let Some(mut job) = unsafe { (*tmp.job.get()).take() } {
                // SAFETY: Same as above.
                unsafe { job.as_mut() }.run(data);
            }
            // Published by the release store on `wait`.
            tmp.completed.store(true, Relaxed);
            tmp.wait.store(false, Release);
            served += 1;
            tmp = next;
        }
        tmp.wait.store(false, Release);
        if served > self.max_tenure.load(Relaxed) {
            self.max_tenure.store(served, Relaxed);
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
    /// its spare node could not be allocated.
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
        let local = self.nodes.local()?;
        let _entered = local.entered.enter();
        let mut task = Task::new(f);

        let spare: NodePtr<T> = local.node.load(Relaxed);
        // SAFETY: A thread's spare node is unreachable by other threads
        // between its calls.
        let next = unsafe { &*spare };
        next.next.store(ptr::null_mut(), Relaxed);
        next.wait.store(true, Relaxed);
        next.completed.store(false, Relaxed);

        // AcqRel hands the reset spare to whoever swaps it out next.
        let cur_ptr = self.nodes.tail.swap(spare, AcqRel);
        // SAFETY: The old tail is never freed while the lock is alive.
        let cur = unsafe { &*cur_ptr };
        // SAFETY: Nobody reads the job of the tail before it gets linked, and
        // `task` outlives the wait below.
        unsafe { *cur.job.get() = Some(task.erase()) };
        cur.next.store(spare, Release);
        local.node.store(cur_ptr, Relaxed);

        let spin_limit = self.config.spin_limit;
        while !relax::spin_then_yield::<R, _>(spin_limit, || !cur.wait.load(Acquire)) {}

        if !cur.completed.load(Relaxed) {
            // SAFETY: Woken without completion.
            unsafe { self.combine(cur) };
        }
        Ok(task.into_output())
    }

    /// Runs `f` against the protected data, possibly on another thread, and
    /// returns its output.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread's node could not be allocated, see
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

impl_delegate_lock!(Mutex);

impl<T, R> fmt::Debug for Mutex<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("max_tenure", &self.max_tenure())
            .field("hop_bound", &self.config.hop_bound)
            .finish_non_exhaustive()
    }
}

/// A CC-Synch lock whose waiters spin while their request is pending.
pub mod spins {
    /// A [`ccsynch::Mutex`](crate::ccsynch::Mutex) with the [`Spin`](crate::relax::Spin)
    /// relax policy.
    pub type Mutex<T> = super::Mutex<T, crate::relax::Spin>;
}

/// A CC-Synch lock whose waiters yield on every spin round.
pub mod yields {
    /// A [`ccsynch::Mutex`](crate::ccsynch::Mutex) with the
    /// [`Yield`](crate::relax::Yield) relax policy.
    pub type Mutex<T> = super::Mutex<T, crate::relax::Yield>;
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::Mutex;
    use crate::relax::{Backoff, Yield};
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
    type BackoffMutex<T> = Mutex<T, Backoff>;

    #[test]
    fn lots_and_lots() {
        tests::lots_and_lots::<SpinMutex<_>>();
        tests::lots_and_lots::<YieldMutex<_>>();
        tests::lots_and_lots::<BackoffMutex<_>>();
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
    fn alone_serves_itself() {
        let mutex = SpinMutex::new(0_u32);
        for i in 1..=10 {
            assert_eq!(mutex.lock_then(|data| { *data += 1; *data }), i);
        }
        assert_eq!(mutex.max_tenure(), 1);
    }

    fn hammer(hop_bound: usize) -> Arc<SpinMutex<u64>> {
        const THREADS: usize = 8;
        const ITERS: usize = 2_000;
        let config = Config::new().hop_bound(hop_bound);
        let mutex = Arc::new(SpinMutex::with_config(0, config));
        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..ITERS {
                        mutex.lock_then(|data| *data += 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(mutex.lock_then(|data| *data), (THREADS * ITERS) as u64);
        mutex
    }

    #[test]
    fn tenure_respects_hop_bound() {
        assert!(hammer(1).max_tenure() <= 1);
        assert!(hammer(4).max_tenure() <= 4);
        assert!(hammer(16).max_tenure() <= 16);
    }

    #[test]
    fn nodes_outlive_their_threads() {
        // Spares travel between threads. Dropping the lock after every
        // participant exited must free each node exactly once.
        let mutex = hammer(2);
        let mutex = Arc::into_inner(mutex).unwrap();
        assert_eq!(mutex.into_inner(), 16_000);
    }

    #[test]
    fn debug_shows_tenure() {
        let mutex = SpinMutex::new(());
        mutex.lock_then(|()| ());
        assert_eq!(format!("{mutex:?}"), "Mutex { max_tenure: 1, hop_bound: 16, .. }");
    }
}
