//! Request records and the per server table they live in.

use core::fmt;
use core::ptr;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize};

use crossbeam_utils::CachePadded;
use thread_local::ThreadLocal;

use crate::delegate::{RawJob, Slot};
use crate::error::Error;

/// The request record of one client thread.
///
/// The client writes the target lock's holder field and then publishes its
/// job. A serving thread first claims the record, so no two serving threads
/// ever look at the same job, then claims the lock itself through the holder
/// field before executing.
pub(super) struct Request {
    slot: Slot<()>,
    holder: AtomicPtr<AtomicUsize>,
    claimed: AtomicBool,
}

// SAFETY: The job pointer is only dereferenced by the serving thread that
// claimed the record, while the client that published it is blocked.
unsafe impl Send for Request {}
// SAFETY: Same as above.
unsafe impl Sync for Request {}

impl Request {
    fn new() -> Self {
        Self {
            slot: Slot::new(),
            holder: AtomicPtr::new(ptr::null_mut()),
            claimed: AtomicBool::new(false),
        }
    }

    /// Publishes `job`, to be executed while holding `holder`.
    ///
    /// # Safety
    ///
    /// Only the client that owns this record may publish, one request at a
    /// time. Both `holder` and the job must stay valid until
    /// [`Request::is_pending`] returns `false`.
    pub(super) unsafe fn publish(&self, holder: &AtomicUsize, job: RawJob<()>) {
        self.holder.store(holder as *const AtomicUsize as *mut AtomicUsize, Relaxed);
        // SAFETY: Caller upholds the publication contract.
        unsafe { self.slot.publish(job) };
    }

    pub(super) fn is_pending(&self) -> bool {
        self.slot.is_pending()
    }

    /// Returns the record to idle after the client saw it served.
    pub(super) fn finish(&self) {
        self.slot.finish();
    }

    /// Tries to execute the pending request on behalf of serving thread `id`.
    /// Returns `true` if it ran.
    ///
    /// Returns `false` without waiting if another serving thread is looking
    /// at this record or holds the lock the request targets.
    pub(super) fn serve(&self, id: usize) -> bool {
        if !self.slot.is_pending() {
            return false;
        }
        if self.claimed.compare_exchange(false, true, Acquire, Relaxed).is_err() {
            return false;
        }
        let mut served = false;
        if self.slot.is_pending() {
            // SAFETY: The pending state was observed with acquire ordering,
            // and the client keeps the lock alive until the request is served.
            let holder = unsafe { &*self.holder.load(Relaxed) };
            if holder.compare_exchange(0, id, Acquire, Relaxed).is_ok() {
                // SAFETY: This thread claimed the record and holds the lock;
                // the holder is released before the client is let go.
                unsafe { self.slot.execute_then(&mut (), || holder.store(0, Release)) };
                served = true;
            }
        }
        self.claimed.store(false, Release);
        served
    }
}

/// The fixed size table of client request records of one server.
pub(super) struct Table {
    requests: Box<[CachePadded<Request>]>,
    clients: ThreadLocal<usize>,
    taken: AtomicUsize,
}

impl Table {
    pub(super) fn new(capacity: usize) -> Self {
        let requests = (0..capacity).map(|_| CachePadded::new(Request::new())).collect();
        Self { requests, clients: ThreadLocal::new(), taken: AtomicUsize::new(0) }
    }

    /// Returns the calling thread's request record, assigning it a free one
    /// on its first call.
    ///
    /// A record stays assigned to its thread for the lifetime of the server
    /// and is handed to a later thread only once its owner has exited.
    pub(super) fn local(&self) -> Result<&Request, Error> {
        let capacity = self.requests.len();
        let index = self.clients.get_or_try(|| {
            self.taken
                .fetch_update(Relaxed, Relaxed, |taken| (taken < capacity).then_some(taken + 1))
                .map_err(|_| Error::ClientsExhausted { capacity })
        })?;
        Ok(&self.requests[*index])
    }

    pub(super) fn iter(&self) -> impl Iterator<Item = &Request> {
        self.requests.iter().map(|request| &**request)
    }

    pub(super) fn capacity(&self) -> usize {
        self.requests.len()
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("capacity", &self.capacity())
            .field("taken", &self.taken.load(Relaxed))
            .finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use core::sync::atomic::AtomicUsize;
    use core::sync::atomic::Ordering::Relaxed;
    use std::thread;

    use super::Table;
    use crate::delegate::{self, Job};
    use crate::error::Error;

    struct Bump<'a>(&'a AtomicUsize);

    impl Job<()> for Bump<'_> {
        fn run(&mut self, _: &mut ()) {
            self.0.fetch_add(1, Relaxed);
        }
    }

    #[test]
    fn served_once_and_holder_released() {
        let table = Table::new(2);
        let request = table.local().unwrap();
        let holder = AtomicUsize::new(0);
        let runs = AtomicUsize::new(0);
        let mut job = Bump(&runs);
        unsafe { request.publish(&holder, delegate::erase(&mut job)) };
        assert!(request.serve(1));
        assert!(!request.serve(2));
        assert!(!request.is_pending());
        request.finish();
        assert_eq!(runs.load(Relaxed), 1);
        assert_eq!(holder.load(Relaxed), 0);
    }

    #[test]
    fn busy_holder_defers_the_request() {
        let table = Table::new(1);
        let request = table.local().unwrap();
        let holder = AtomicUsize::new(7);
        let runs = AtomicUsize::new(0);
        let mut job = Bump(&runs);
        unsafe { request.publish(&holder, delegate::erase(&mut job)) };
        assert!(!request.serve(1));
        assert!(request.is_pending());
        holder.store(0, Relaxed);
        assert!(request.serve(1));
        request.finish();
        assert_eq!(runs.load(Relaxed), 1);
    }

    #[test]
    fn one_record_per_client() {
        let table = Table::new(1);
        let mine = table.local().unwrap() as *const _;
        assert_eq!(table.local().unwrap() as *const _, mine);
        thread::scope(|s| {
            let result = s.spawn(|| table.local().map(|_| ())).join().unwrap();
            assert!(matches!(result, Err(Error::ClientsExhausted { capacity: 1 })));
        });
    }
}
