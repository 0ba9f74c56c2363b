use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use dlock::rcl::Server;
use dlock::{ccsynch, fc, fcf, fcfpq, rcl, ticket, Config, DelegateLock, ServerConfig};

/// Hammers `lock` from `threads` threads, `iters` increments each, and
/// checks that no increment was lost.
fn increments<L>(lock: L, threads: usize, iters: u64)
where
    L: DelegateLock<Target = u64> + Send + Sync + 'static,
{
    let lock = Arc::new(lock);
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..iters {
                    lock.lock_then(|n| *n += 1);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(lock.lock_then(|n| *n), threads as u64 * iters);
}

/// Every caller gets back its own argument, transformed by its own closure.
fn own_results<L>(lock: L)
where
    L: DelegateLock<Target = u64> + Send + Sync + 'static,
{
    let lock = Arc::new(lock);
    let handles: Vec<_> = (0..8_u64)
        .map(|t| {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                for i in 0..500 {
                    let arg = t * 1_000 + i;
                    let out = lock.lock_then(move |n| {
                        *n += 1;
                        arg * 2
                    });
                    assert_eq!(out, arg * 2);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(lock.lock_then(|n| *n), 4_000);
}

/// No two closures of the same lock ever overlap.
fn exclusive<L>(lock: L)
where
    L: DelegateLock<Target = u64> + Send + Sync + 'static,
{
    let lock = Arc::new(lock);
    let inside = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..6)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            thread::spawn(move || {
                for _ in 0..300 {
                    lock.lock_then(|n| {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        *n += 1;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

fn server() -> Server {
    Server::start(ServerConfig::new().name("it")).unwrap()
}

#[test]
fn flat_combining() {
    increments(fc::spins::Mutex::new(0), 8, 2_000);
    own_results(fc::spins::Mutex::new(0));
    exclusive(fc::spins::Mutex::new(0));
}

#[test]
fn fair_flat_combining() {
    increments(fcf::spins::Mutex::new(0), 8, 2_000);
    own_results(fcf::spins::Mutex::new(0));
    exclusive(fcf::yields::Mutex::new(0));
}

#[test]
fn priority_queue_flat_combining() {
    increments(fcfpq::spins::Mutex::new(0), 8, 2_000);
    own_results(fcfpq::spins::Mutex::with_config(0, Config::new().decay(true)));
    exclusive(fcfpq::spins::Mutex::new(0));
}

#[test]
fn cc_synch() {
    increments(ccsynch::spins::Mutex::with_config(0, Config::new().hop_bound(4)), 8, 2_000);
    own_results(ccsynch::spins::Mutex::new(0));
    exclusive(ccsynch::spins::Mutex::new(0));
}

#[test]
fn remote_core_locking() {
    let server = server();
    increments(rcl::spins::Mutex::new(&server, 0), 8, 2_000);
    own_results(rcl::spins::Mutex::new(&server, 0));
    exclusive(rcl::spins::Mutex::new(&server, 0));
}

#[test]
fn ticket_baseline() {
    increments(ticket::spins::Mutex::new(0), 8, 2_000);
    own_results(ticket::spins::Mutex::new(0));
    exclusive(ticket::spins::Mutex::new(0));
}

#[test]
fn closures_borrow_caller_locals() {
    let words = ["delegate", "combine", "serve"];
    let mutex = fc::spins::Mutex::new(HashSet::new());
    let lock = &mutex;
    thread::scope(|s| {
        for word in words {
            s.spawn(move || lock.lock_then(|set| set.insert(word)));
        }
    });
    assert_eq!(mutex.into_inner().len(), words.len());
}

#[test]
fn error_is_reported_not_aborted() {
    let server = Server::start(ServerConfig::new().clients(1).name("it-full")).unwrap();
    let lock = rcl::spins::Mutex::new(&server, 0_u64);
    lock.lock_then(|n| *n += 1);
    let err = thread::scope(|s| s.spawn(|| lock.checked_lock_then(|n| *n)).join().unwrap())
        .unwrap_err();
    assert_eq!(err.to_string(), "server request table is full (1 clients)");
}

#[test]
#[ignore = "stress test, run with --ignored"]
fn stress_every_lock() {
    const THREADS: usize = 32;
    const ITERS: u64 = 50_000;

    increments(fc::spins::Mutex::new(0), THREADS, ITERS);
    increments(fcf::spins::Mutex::new(0), THREADS, ITERS);
    increments(fcfpq::spins::Mutex::new(0), THREADS, ITERS);
    increments(ccsynch::spins::Mutex::new(0), THREADS, ITERS);
    let server = server();
    increments(rcl::spins::Mutex::new(&server, 0), THREADS, ITERS);
}
