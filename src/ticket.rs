//! A ticket lock.
//!
//! The plain FIFO spinlock the combining locks are measured against. A thread
//! takes the next ticket and spins until the lock serves it; unlocking serves
//! the next ticket. [`Mutex`] runs delegated closures on the calling thread,
//! so it is a drop-in [`DelegateLock`] baseline.
//!
//! [`DelegateLock`]: crate::DelegateLock

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::panic::Location;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crossbeam_utils::CachePadded;

use crate::cfg::atomic::AtomicU32;
use crate::error::Error;
use crate::lock::{impl_delegate_lock, panic_lock_failed};
use crate::relax::{Relax, Spin};

/// The raw ticket lock, without any protected data.
///
/// # Examples
///
/// ```
/// use dlock::ticket::RawTicketLock;
///
/// let lock = RawTicketLock::<dlock::relax::Spin>::new();
/// lock.lock();
/// assert!(lock.is_locked());
/// assert!(!lock.try_lock());
/// // SAFETY: The lock is held by this thread.
/// unsafe { lock.unlock() };
/// assert!(!lock.is_locked());
/// ```
pub struct RawTicketLock<R = Spin> {
    next: CachePadded<AtomicU32>,
    serving: CachePadded<AtomicU32>,
    marker: PhantomData<R>,
}

impl<R> RawTicketLock<R> {
    /// Creates an unlocked ticket lock.
    #[cfg(not(all(loom, test)))]
    pub const fn new() -> Self {
        let next = CachePadded::new(AtomicU32::new(0));
        let serving = CachePadded::new(AtomicU32::new(0));
        Self { next, serving, marker: PhantomData }
    }

    /// Creates an unlocked ticket lock with Loom primitives (non-const).
    #[cfg(all(loom, test))]
    pub fn new() -> Self {
        let next = CachePadded::new(AtomicU32::new(0));
        let serving = CachePadded::new(AtomicU32::new(0));
        Self { next, serving, marker: PhantomData }
    }

    /// Attempts to acquire the lock without waiting. Returns `true` on
    /// success.
    pub fn try_lock(&self) -> bool {
        let serving = self.serving.load(Acquire);
        self.next.compare_exchange(serving, serving.wrapping_add(1), Acquire, Relaxed).is_ok()
    }

    /// Releases the lock, serving the next ticket.
    ///
    /// # Safety
    ///
    /// The lock must be held by the current context.
    pub unsafe fn unlock(&self) {
        // Only the holder writes `serving`.
        let serving = self.serving.load(Relaxed);
        self.serving.store(serving.wrapping_add(1), Release);
    }

    /// Returns `true` if the lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.queue_len() != 0
    }

    /// Returns the number of tickets handed out and not yet served to
    /// completion, the holder's included.
    pub fn queue_len(&self) -> u32 {
        self.next.load(Relaxed).wrapping_sub(self.serving.load(Relaxed))
    }
}

impl<R: Relax> RawTicketLock<R> {
    /// Takes a ticket and waits until it is served.
    pub fn lock(&self) {
        let ticket = self.next.fetch_add(1, Relaxed);
        let mut relax = R::new();
        while self.serving.load(Acquire) != ticket {
            relax.relax();
        }
    }
}

impl<R> Default for RawTicketLock<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> fmt::Debug for RawTicketLock<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawTicketLock")
            .field("next", &self.next.load(Relaxed))
            .field("serving", &self.serving.load(Relaxed))
            .finish()
    }
}

/// Unlocks on drop, also when unwinding.
struct Held<'a, R>(&'a RawTicketLock<R>);

impl<R> Drop for Held<'_, R> {
    fn drop(&mut self) {
        // SAFETY: A `Held` is only created right after acquiring the lock.
        unsafe { self.0.unlock() };
    }
}

/// A ticket lock protecting some data.
///
/// # Examples
///
/// ```
/// use dlock::ticket::spins::Mutex;
///
/// let mutex = Mutex::new(vec![1, 2]);
/// let len = mutex.lock_then(|v| {
///     v.push(3);
///     v.len()
/// });
/// assert_eq!(len, 3);
/// ```
pub struct Mutex<T, R = Spin> {
    lock: RawTicketLock<R>,
    data: UnsafeCell<T>,
}

// SAFETY: The data is only reached while holding the ticket lock.
unsafe impl<T: Send, R> Send for Mutex<T, R> {}
// SAFETY: Same as above.
unsafe impl<T: Send, R> Sync for Mutex<T, R> {}

impl<T, R> Mutex<T, R> {
    /// Creates a new unlocked ticket mutex.
    #[cfg(not(all(loom, test)))]
    pub const fn new(value: T) -> Self {
        Self { lock: RawTicketLock::new(), data: UnsafeCell::new(value) }
    }

    /// Creates a new unlocked ticket mutex with Loom primitives (non-const).
    #[cfg(all(loom, test))]
    pub fn new(value: T) -> Self {
        Self { lock: RawTicketLock::new(), data: UnsafeCell::new(value) }
    }

    /// Consumes this mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Returns a mutable reference to the underlying data.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Returns `true` if the lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}

impl<T, R: Relax> Mutex<T, R> {
    /// Acquires the lock, runs `f` on the calling thread and releases the
    /// lock. Never returns an error; the `Result` keeps the signature uniform
    /// with the combining locks.
    ///
    /// # Panics
    ///
    /// Resumes a panic raised by `f`, after releasing the lock. Calling the
    /// same lock from inside `f` deadlocks.
    pub fn checked_lock_then<F, Ret>(&self, f: F) -> Result<Ret, Error>
    where
        F: FnOnce(&mut T) -> Ret + Send,
        Ret: Send,
    {
        self.lock.lock();
        let _held = Held(&self.lock);
        // SAFETY: The ticket lock is held until `_held` drops.
        let data = unsafe { &mut *self.data.get() };
        Ok(f(data))
    }

    /// Acquires the lock, runs `f` on the calling thread and releases the
    /// lock.
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
        f.debug_struct("Mutex").field("locked", &self.is_locked()).finish_non_exhaustive()
    }
}

/// A ticket lock whose waiters spin for their turn.
pub mod spins {
    /// A [`ticket::Mutex`](crate::ticket::Mutex) with the
    /// [`Spin`](crate::relax::Spin) relax policy.
    pub type Mutex<T> = super::Mutex<T, crate::relax::Spin>;
}

/// A ticket lock whose waiters yield while waiting for their turn.
pub mod yields {
    /// A [`ticket::Mutex`](crate::ticket::Mutex) with the
    /// [`Yield`](crate::relax::Yield) relax policy.
    pub type Mutex<T> = super::Mutex<T, crate::relax::Yield>;
}

#[cfg(all(feature = "lock_api", not(loom)))]
// SAFETY: Tickets are handed out once each and only the holder advances
// `serving`, so at most one context holds the lock.
unsafe impl<R: Relax> lock_api::RawMutex for RawTicketLock<R> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();

    type GuardMarker = lock_api::GuardSend;

    fn lock(&self) {
        Self::lock(self);
    }

    fn try_lock(&self) -> bool {
        Self::try_lock(self)
    }

    unsafe fn unlock(&self) {
        // SAFETY: Caller guarantees the lock is held.
        unsafe { Self::unlock(self) }
    }

    fn is_locked(&self) -> bool {
        Self::is_locked(self)
    }
}

#[cfg(test)]
impl<T, R> crate::test::LockNew for Mutex<T, R> {
    type Target = T;

    fn new(value: T) -> Self {
        Self::new(value)
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::{Mutex, RawTicketLock};
    use crate::relax::{Spin, Yield};
    use crate::test::tests;
    use crate::test::LockData;

    impl<T, R> LockData for Mutex<T, R> {
        fn into_inner(self) -> T {
            self.into_inner()
        }

        fn get_mut(&mut self) -> &mut T {
            self.get_mut()
        }
    }

    type SpinMutex<T> = Mutex<T, Spin>;
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
    fn try_lock_fails_while_held() {
        let lock = RawTicketLock::<Spin>::new();
        assert!(lock.try_lock());
        assert!(lock.is_locked());
        assert!(!lock.try_lock());
        unsafe { lock.unlock() };
        assert!(!lock.is_locked());
        assert!(lock.try_lock());
        unsafe { lock.unlock() };
    }

    #[test]
    fn queue_counts_holder_and_waiters() {
        let lock = Arc::new(RawTicketLock::<Yield>::new());
        assert_eq!(lock.queue_len(), 0);
        lock.lock();
        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.lock();
                unsafe { lock.unlock() };
            })
        };
        while lock.queue_len() < 2 {
            thread::yield_now();
        }
        unsafe { lock.unlock() };
        waiter.join().unwrap();
        assert_eq!(lock.queue_len(), 0);
    }

    #[test]
    fn statically_initialized() {
        static COUNT: Mutex<u32> = Mutex::new(0);
        let handles: Vec<_> = (0..4)
            .map(|_| thread::spawn(|| COUNT.lock_then(|count| *count += 1)))
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(COUNT.lock_then(|count| *count), 4);
    }

    #[test]
    fn unlocked_after_panic() {
        let mutex = Arc::new(SpinMutex::new(0_u32));
        let c_mutex = Arc::clone(&mutex);
        let _ = thread::spawn(move || c_mutex.lock_then(|_| panic!())).join();
        assert!(!mutex.is_locked());
    }

    #[test]
    fn debug_reports_state() {
        let mutex = SpinMutex::new(1_u32);
        assert_eq!(format!("{mutex:?}"), "Mutex { locked: false, .. }");
    }
}

#[cfg(all(loom, test))]
mod model {
    use super::Mutex;
    use crate::loom::models;
    use crate::relax::Yield;

    #[test]
    fn lock_join() {
        models::lock_join::<Mutex<_>>();
    }

    #[test]
    fn lock_join_yield() {
        models::lock_join::<Mutex<_, Yield>>();
    }
}
