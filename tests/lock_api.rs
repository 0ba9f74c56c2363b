// Part of this test suite comes from the Rust's Mutex implementation, with
// modifications for the ticket lock and some new tests as well.
//
// Copyright 2014 The Rust Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::mpsc::channel;
use std::sync::{Arc, Barrier};
use std::thread;

use dlock::lock_api::{spins, yields};

#[test]
fn lots_and_lots() {
    static LOCK: yields::Mutex<u32> = yields::Mutex::new(0);

    const ITERS: u32 = 1000;
    const CONCURRENCY: u32 = 4;

    let (tx, rx) = channel();
    for _ in 0..CONCURRENCY {
        let tx = tx.clone();
        thread::spawn(move || {
            for _ in 0..ITERS {
                *LOCK.lock() += 1;
            }
            tx.send(()).unwrap();
        });
    }
    drop(tx);
    for _ in 0..CONCURRENCY {
        rx.recv().unwrap();
    }
    assert_eq!(*LOCK.lock(), ITERS * CONCURRENCY);
}

#[test]
fn try_lock_while_held() {
    let mutex = spins::Mutex::new(1);
    let guard = mutex.lock();
    assert!(mutex.is_locked());
    assert!(mutex.try_lock().is_none());
    drop(guard);
    assert_eq!(*mutex.try_lock().unwrap(), 1);
    assert!(!mutex.is_locked());
}

#[test]
fn guard_is_sendable() {
    let mutex = spins::Mutex::new(Vec::new());
    let guard = mutex.lock();
    thread::scope(|s| {
        s.spawn(move || {
            let mut guard = guard;
            guard.push(1);
        });
    });
    assert_eq!(*mutex.lock(), [1]);
}

#[test]
fn served_in_ticket_order() {
    let mutex = Arc::new(yields::Mutex::new(Vec::new()));
    let held = mutex.lock();
    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..3_u32)
        .map(|i| {
            let c_mutex = Arc::clone(&mutex);
            let c_barrier = Arc::clone(&barrier);
            let handle = thread::spawn(move || {
                c_barrier.wait();
                c_mutex.lock().push(i);
            });
            // Let the thread take its ticket before the next one starts.
            barrier.wait();
            while unsafe { mutex.raw() }.queue_len() < i + 2 {
                thread::yield_now();
            }
            handle
        })
        .collect();
    drop(held);
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(*mutex.lock(), [0, 1, 2]);
}

#[test]
fn test_lock_arc_access_in_unwind() {
    let arc = Arc::new(yields::Mutex::new(1));
    let arc2 = arc.clone();
    let _ = thread::spawn(move || {
        struct Unwinder {
            i: Arc<yields::Mutex<i32>>,
        }
        impl Drop for Unwinder {
            fn drop(&mut self) {
                *self.i.lock() += 1;
            }
        }
        let _u = Unwinder { i: arc2 };
        panic!();
    })
    .join();
    assert_eq!(*arc.lock(), 2);
}

#[test]
fn test_lock_unsized() {
    let lock: &spins::Mutex<[i32]> = &spins::Mutex::new([1, 2, 3]);
    {
        let b = &mut *lock.lock();
        b[0] = 4;
        b[2] = 5;
    }
    let comp: &[i32] = &[4, 2, 5];
    assert_eq!(&*lock.lock(), comp);
}
