//! The lock side of remote core locking.
//!
//! A client publishes its closure in its own request record, tagged with
//! the lock's holder field, and spins until a serving thread ran it.

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::panic::Location;
use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::thread;

use crossbeam_utils::CachePadded;

use super::server::Server;
use crate::config::Config;
use crate::delegate::{self, Job, Task};
use crate::error::Error;
use crate::lock::{panic_lock_failed, DelegateLock};
use crate::registry::panic_reentrant;
use crate::relax::{self, Relax, Spin};

/// Value of the holder field while no serving thread runs the lock's critical
/// sections. Serving thread ids start at one.
const UNHELD: usize = 0;

/// A lock whose critical sections run on the serving threads of an RCL
/// [`Server`].
///
/// A calling thread writes its request into its own slot of the server's
/// request table and waits until a serving thread has executed it. If the
/// caller already is one of the server's serving threads, which happens when
/// a critical section calls another lock of the same server, it claims the
/// lock itself and runs the closure in place.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use dlock::rcl::spins::Mutex;
/// use dlock::rcl::Server;
/// use dlock::ServerConfig;
///
/// let server = Server::start(ServerConfig::new())?;
/// let mutex = Arc::new(Mutex::new(&server, 0));
/// let handles: Vec<_> = (0..4)
///     .map(|_| {
///         let mutex = Arc::clone(&mutex);
///         thread::spawn(move || mutex.lock_then(|n| *n += 1))
///     })
///     .collect();
/// for handle in handles {
///     handle.join().unwrap();
/// }
/// assert_eq!(mutex.lock_then(|n| *n), 4);
/// # Ok::<(), dlock::Error>(())
/// ```
pub struct Mutex<T, R = Spin> {
    holder: CachePadded<AtomicUsize>,
    server: Server,
    spin_limit: u32,
    data: UnsafeCell<T>,
    marker: PhantomData<R>,
}

// SAFETY: The data is only reached by the thread that owns the holder field.
unsafe impl<T: Send, R> Send for Mutex<T, R> {}
// SAFETY: Same as above.
unsafe impl<T: Send, R> Sync for Mutex<T, R> {}

impl<T, R> Mutex<T, R> {
    /// Creates a new lock served by `server`.
    pub fn new(server: &Server, value: T) -> Self {
        Self::with_config(server, value, Config::new())
    }

    /// Creates a new lock served by `server`. Only the spin limit of `config`
    /// applies to RCL locks.
    pub fn with_config(server: &Server, value: T, config: Config) -> Self {
        Self {
            holder: CachePadded::new(AtomicUsize::new(UNHELD)),
            server: server.clone(),
            spin_limit: config.spin_limit,
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

    /// Returns the server this lock delegates to.
    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Runs `f` in place on serving thread `id`, once no other serving thread
    /// holds this lock.
    fn serve_self<F, Ret>(&self, id: usize, f: F, caller: &Location<'static>) -> Ret
    where
        F: FnOnce(&mut T) -> Ret,
    {
        loop {
            match self.holder.compare_exchange(UNHELD, id, Acquire, Relaxed) {
                Ok(_) => break,
                Err(holder) if holder == id => panic_reentrant(caller),
                Err(_) => thread::yield_now(),
            }
        }
        let _held = Held(&self.holder);
        // SAFETY: This thread owns the holder field until `_held` drops.
        f(unsafe { &mut *self.data.get() })
    }
}

impl<T, R: Relax> Mutex<T, R> {
    /// Runs `f` against the protected data on one of the server's threads and
    /// returns its output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientsExhausted`] if this is the calling thread's
    /// first call on the server and no client slot is left.
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
        let shared = self.server.shared();
        if let Some(id) = shared.current_id() {
            return Ok(self.serve_self(id, f, Location::caller()));
        }
        let request = shared.table.local()?;
        let mut job = Bound { data: self.data.get(), task: Task::new(f) };
        // SAFETY: Both the job and the holder field outlive the request,
        // since this thread does not return before it was served.
        unsafe { request.publish(&self.holder, delegate::erase(&mut job)) };
        while !relax::spin_then_yield::<R, _>(self.spin_limit, || !request.is_pending()) {}
        request.finish();
        Ok(job.task.into_output())
    }

    /// Runs `f` against the protected data on one of the server's threads and
    /// returns its output.
    ///
    /// # Panics
    ///
    /// Panics if the server has no client slot left for the calling thread,
    /// see [`checked_lock_then`](Self::checked_lock_then).
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

impl<T, R: Relax> DelegateLock for Mutex<T, R> {
    type Target = T;

    #[track_caller]
    fn checked_lock_then<F, Ret>(&self, f: F) -> Result<Ret, Error>
    where
        F: FnOnce(&mut T) -> Ret + Send,
        Ret: Send,
    {
        Self::checked_lock_then(self, f)
    }

    #[track_caller]
    fn lock_then<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(&mut T) -> Ret + Send,
        Ret: Send,
    {
        Self::lock_then(self, f)
    }
}

impl<T, R> fmt::Debug for Mutex<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("held", &(self.holder.load(Relaxed) != UNHELD))
            .finish_non_exhaustive()
    }
}

/// A task bound to the data of the lock it was submitted to, so a serving
/// thread can run it without knowing the data's type.
struct Bound<T, F, Ret> {
    data: *mut T,
    task: Task<F, Ret>,
}

impl<T, F, Ret> Job<()> for Bound<T, F, Ret>
where
    F: FnOnce(&mut T) -> Ret,
{
    fn run(&mut self, _: &mut ()) {
        // SAFETY: Serving threads run a request only while holding the
        // holder field of the lock it targets.
        let data = unsafe { &mut *self.data };
        Job::<T>::run(&mut self.task, data);
    }
}

/// Releases the holder field on drop, also when unwinding.
struct Held<'a>(&'a AtomicUsize);

impl Drop for Held<'_> {
    fn drop(&mut self) {
        self.0.store(UNHELD, Release);
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, OnceLock};
    use std::thread;
    use std::time::Duration;

    use super::Mutex;
    use crate::config::ServerConfig;
    use crate::error::Error;
    use crate::rcl::Server;
    use crate::relax::{Backoff, Yield};
    use crate::test::tests;
    use crate::test::{LockData, LockNew};

    /// The server shared by every lock built through `LockNew`.
    fn shared_server() -> &'static Server {
        static SERVER: OnceLock<Server> = OnceLock::new();
        SERVER.get_or_init(|| {
            tests::init_logger();
            let config = ServerConfig::new().clients(512).name("rcl-test");
            Server::start(config).expect("test server failed to start")
        })
    }

    impl<T, R> LockNew for Mutex<T, R> {
        type Target = T;

        fn new(value: T) -> Self {
            Self::new(shared_server(), value)
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
    fn nested_locks_are_self_served() {
        let config = ServerConfig::new().tick(Duration::from_secs(60)).name("nested");
        let server = Server::start(config).unwrap();
        let outer = Mutex::<_>::new(&server, 1_u64);
        let inner = Mutex::<_>::new(&server, 10_u64);
        let sum = outer.lock_then(|o| {
            let i = inner.lock_then(|i| {
                *i += 1;
                *i
            });
            *o + i
        });
        assert_eq!(sum, 12);
        assert_eq!(inner.lock_then(|i| *i), 11);
        assert_eq!(server.threads(), 1);
    }

    #[test]
    fn recursive_call_panics_and_lock_survives() {
        let server = Server::start(ServerConfig::new().name("recursive")).unwrap();
        let mutex = Mutex::<_>::new(&server, 0_u32);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            mutex.lock_then(|_| mutex.lock_then(|n| *n))
        }));
        let payload = result.unwrap_err();
        let message = payload.downcast_ref::<String>().unwrap();
        assert!(message.contains("from inside one of its own delegates"));
        assert_eq!(mutex.lock_then(|n| { *n += 1; *n }), 1);
    }

    #[test]
    fn one_server_many_locks() {
        let server = Server::start(ServerConfig::new().name("many")).unwrap();
        let locks: Arc<Vec<Mutex<u64>>> =
            Arc::new((0..8).map(|_| Mutex::new(&server, 0)).collect());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let locks = Arc::clone(&locks);
                thread::spawn(move || {
                    for i in 0..1000 {
                        locks[(t + i) % locks.len()].lock_then(|n| *n += 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let total: u64 = locks.iter().map(|lock| lock.lock_then(|n| *n)).sum();
        assert_eq!(total, 4000);
    }

    #[test]
    fn clients_exhausted() {
        let server = Server::start(ServerConfig::new().clients(1).name("full")).unwrap();
        let mutex = Mutex::<_>::new(&server, 0_u32);
        mutex.lock_then(|n| *n += 1);
        thread::scope(|s| {
            let result = s.spawn(|| mutex.checked_lock_then(|n| *n)).join().unwrap();
            assert!(matches!(result, Err(Error::ClientsExhausted { capacity: 1 })));
        });
        assert_eq!(mutex.lock_then(|n| *n), 1);
    }

    #[test]
    fn stuck_thread_is_relieved() {
        tests::init_logger();
        let config =
            ServerConfig::new().max_threads(2).tick(Duration::from_millis(2)).name("stuck");
        let server = Server::start(config).unwrap();
        let blocked = Mutex::<_>::new(&server, ());
        let other = Mutex::<_>::new(&server, ());
        let entered = AtomicBool::new(false);
        let released = AtomicBool::new(false);
        thread::scope(|s| {
            s.spawn(|| {
                blocked.lock_then(|()| {
                    entered.store(true, Ordering::SeqCst);
                    while !released.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(1));
                    }
                });
            });
            while !entered.load(Ordering::SeqCst) {
                thread::yield_now();
            }
            // Served only once the management thread notices the first
            // serving thread is stuck and brings up a second one.
            other.lock_then(|()| released.store(true, Ordering::SeqCst));
        });
        assert_eq!(server.threads(), 2);
    }

    #[test]
    fn debug_reports_holder() {
        let server = Server::start(ServerConfig::new().name("debug")).unwrap();
        let mutex = Mutex::<_>::new(&server, 0_u32);
        assert_eq!(format!("{mutex:?}"), "Mutex { held: false, .. }");
    }
}
