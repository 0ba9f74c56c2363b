//! Serving threads and their management thread.
//!
//! Serving threads scan the request table and park on a lock-free stack
//! once they stay idle while others are serving. The management thread
//! relieves a pool whose threads are all stuck and joins everything on
//! shutdown.

use core::fmt;
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use core::sync::atomic::{AtomicBool, AtomicUsize};
use std::cell::Cell;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_utils::{Backoff, CachePadded};
use log::{debug, error};

use super::request::Table;
use crate::config::ServerConfig;
use crate::error::Error;
use crate::park::Parker;
use crate::stack::Stack;

/// Fruitless scans of the request table before a redundant serving thread
/// parks itself.
const PARK_AFTER: u32 = 1024;

thread_local! {
    /// The server and serving thread id the current thread works for.
    static CURRENT: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

/// A serving thread as seen by the management thread.
struct Worker {
    id: usize,
    parker: Parker,
}

/// State shared by a server's handles, its locks and its threads.
pub(super) struct Shared {
    pub(super) table: Table,
    parked: Stack<Arc<Worker>>,
    serving: CachePadded<AtomicUsize>,
    free: CachePadded<AtomicUsize>,
    heartbeat: CachePadded<AtomicBool>,
    spawned: AtomicUsize,
    stop: AtomicBool,
    config: ServerConfig,
}

impl Shared {
    fn new(config: ServerConfig) -> Self {
        Self {
            table: Table::new(config.clients),
            parked: Stack::new(),
            serving: CachePadded::new(AtomicUsize::new(0)),
            free: CachePadded::new(AtomicUsize::new(0)),
            heartbeat: CachePadded::new(AtomicBool::new(false)),
            spawned: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            config,
        }
    }

    fn key(&self) -> usize {
        self as *const Self as usize
    }

    /// Returns the id of the calling thread if it is one of this server's
    /// serving threads.
    pub(super) fn current_id(&self) -> Option<usize> {
        let key = self.key();
        CURRENT.with(Cell::get).and_then(|(server, id)| (server == key).then_some(id))
    }

    /// Leaves the serving pool, unless this is its last thread.
    fn retire(&self) -> bool {
        let retired = self
            .serving
            .fetch_update(AcqRel, Relaxed, |serving| (serving > 1).then(|| serving - 1))
            .is_ok();
        if retired {
            self.free.fetch_sub(1, Relaxed);
        }
        retired
    }

    /// Counts a woken or spawned thread into the serving pool.
    fn enlist(&self) {
        self.serving.fetch_add(1, AcqRel);
        self.free.fetch_add(1, Relaxed);
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("table", &self.table)
            .field("serving", &self.serving.load(Relaxed))
            .field("free", &self.free.load(Relaxed))
            .field("spawned", &self.spawned.load(Relaxed))
            .finish_non_exhaustive()
    }
}

/// Scans the request table until the server stops, parking whenever the
/// thread turns out to be redundant.
fn serve(shared: &Shared, worker: &Arc<Worker>) {
    CURRENT.with(|current| current.set(Some((shared.key(), worker.id))));
    let backoff = Backoff::new();
    let mut fruitless = 0;
    while !shared.stop.load(Acquire) {
        let mut served = 0;
        for request in shared.table.iter() {
            if !request.is_pending() {
                continue;
            }
            shared.free.fetch_sub(1, Relaxed);
            served += usize::from(request.serve(worker.id));
            shared.free.fetch_add(1, Relaxed);
        }
        shared.heartbeat.store(true, Relaxed);
        if served > 0 {
            fruitless = 0;
            backoff.reset();
            continue;
        }
        fruitless += 1;
        if fruitless >= PARK_AFTER && shared.retire() {
            debug!("{}: serving thread {} parked", shared.config.name, worker.id);
            shared.parked.push(Arc::clone(worker));
            worker.parker.wait();
            debug!("{}: serving thread {} woken", shared.config.name, worker.id);
            fruitless = 0;
            backoff.reset();
            continue;
        }
        backoff.snooze();
    }
    CURRENT.with(|current| current.set(None));
}

fn spawn_worker(shared: &Arc<Shared>, id: usize) -> io::Result<JoinHandle<()>> {
    let worker = Arc::new(Worker { id, parker: Parker::new() });
    shared.enlist();
    shared.spawned.fetch_add(1, Relaxed);
    let spawned = {
        let shared = Arc::clone(shared);
        thread::Builder::new()
            .name(format!("{}-{id}", shared.config.name))
            .spawn(move || serve(&shared, &worker))
    };
    match spawned {
        Ok(handle) => {
            debug!("{}: spawned serving thread {id}", shared.config.name);
            Ok(handle)
        }
        Err(err) => {
            shared.spawned.fetch_sub(1, Relaxed);
            shared.serving.fetch_sub(1, AcqRel);
            shared.free.fetch_sub(1, Relaxed);
            Err(err)
        }
    }
}

/// The management thread: every tick, if no serving thread made progress and
/// none is free, brings one more thread into the pool.
fn manage(shared: &Arc<Shared>, mut workers: Vec<JoinHandle<()>>) {
    let name = &shared.config.name;
    loop {
        thread::park_timeout(shared.config.tick);
        if shared.stop.load(Acquire) {
            break;
        }
        let progressed = shared.heartbeat.swap(false, Relaxed);
        if progressed || shared.free.load(Relaxed) > 0 {
            continue;
        }
        if let Some(worker) = shared.parked.pop() {
            shared.enlist();
            debug!("{name}: waking serving thread {}", worker.id);
            worker.parker.wake_one();
        } else if workers.len() < shared.config.max_threads {
            match spawn_worker(shared, workers.len() + 1) {
                Ok(handle) => workers.push(handle),
                Err(err) => error!("{name}: failed to spawn serving thread: {err}"),
            }
        }
    }
    debug!("{name}: stopping {} serving threads", workers.len());
    for handle in workers {
        while !handle.is_finished() {
            while let Some(worker) = shared.parked.pop() {
                worker.parker.wake_one();
            }
            thread::park_timeout(shared.config.tick);
        }
        if handle.join().is_err() {
            error!("{name}: a serving thread panicked");
        }
    }
}

struct Handle {
    shared: Arc<Shared>,
    manager: Option<JoinHandle<()>>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.shared.stop.store(true, Release);
        let Some(manager) = self.manager.take() else { return };
        manager.thread().unpark();
        // A serving thread cannot wait for itself to be joined.
        if self.shared.current_id().is_some() {
            return;
        }
        if manager.join().is_err() {
            error!("{}: management thread panicked", self.shared.config.name);
        }
    }
}

/// A running RCL server: a pool of serving threads that execute the critical
/// sections of every [`rcl::Mutex`] created on it.
///
/// `Server` is a cheap handle; clones refer to the same server. The server
/// stops, and joins its threads, once the last handle and the last lock
/// created on it are dropped.
///
/// # Examples
///
/// ```
/// use dlock::rcl::spins::Mutex;
/// use dlock::rcl::Server;
/// use dlock::ServerConfig;
///
/// let server = Server::start(ServerConfig::new().max_threads(2))?;
/// let mutex = Mutex::new(&server, 0);
/// assert_eq!(mutex.lock_then(|n| { *n += 1; *n }), 1);
/// # Ok::<(), dlock::Error>(())
/// ```
///
/// [`rcl::Mutex`]: crate::rcl::Mutex
#[derive(Clone)]
pub struct Server {
    handle: Arc<Handle>,
}

impl Server {
    /// Starts a server with one serving thread and its management thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Spawn`] if either thread could not be spawned.
    pub fn start(config: ServerConfig) -> Result<Self, Error> {
        let shared = Arc::new(Shared::new(config));
        let first = spawn_worker(&shared, 1).map_err(Error::Spawn)?;
        let manager = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("{}-manager", shared.config.name))
                .spawn(move || manage(&shared, vec![first]))
        };
        let manager = match manager {
            Ok(manager) => manager,
            Err(err) => {
                // The first serving thread is detached and exits on its own.
                shared.stop.store(true, Release);
                return Err(Error::Spawn(err));
            }
        };
        debug!("{}: started with {} client slots", shared.config.name, shared.config.clients);
        Ok(Self { handle: Arc::new(Handle { shared, manager: Some(manager) }) })
    }

    /// Returns the configuration this server was started with.
    pub fn config(&self) -> &ServerConfig {
        &self.handle.shared.config
    }

    /// Returns the number of serving threads spawned so far, parked ones
    /// included.
    pub fn threads(&self) -> usize {
        self.handle.shared.spawned.load(Relaxed)
    }

    pub(super) fn shared(&self) -> &Shared {
        &self.handle.shared
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared();
        f.debug_struct("Server")
            .field("name", &shared.config.name)
            .field("clients", &shared.table.capacity())
            .field("threads", &self.threads())
            .field("serving", &shared.serving.load(Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use core::sync::atomic::Ordering::Relaxed;
    use std::time::Duration;

    use super::Server;
    use crate::config::ServerConfig;

    #[test]
    fn starts_with_one_thread() {
        let server = Server::start(ServerConfig::new().name("start")).unwrap();
        assert_eq!(server.threads(), 1);
        assert_eq!(server.shared().serving.load(Relaxed), 1);
        assert_eq!(server.config().name, "start");
        assert!(server.shared().current_id().is_none());
    }

    #[test]
    fn stops_when_last_handle_drops() {
        let server = Server::start(ServerConfig::new().tick(Duration::from_millis(1))).unwrap();
        let clone = server.clone();
        drop(server);
        assert!(!clone.shared().stop.load(Relaxed));
        drop(clone);
    }

    #[test]
    fn debug_lists_pool() {
        let server = Server::start(ServerConfig::new().name("dbg").clients(3)).unwrap();
        let debug = format!("{server:?}");
        assert!(debug.starts_with("Server { name: \"dbg\", clients: 3, threads: 1"));
    }
}
