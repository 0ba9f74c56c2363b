use crate::lock::DelegateLock;

/// A trait for lock types that can hold user defined values.
pub trait LockNew {
    /// The type of the value this lock holds.
    type Target;

    /// Creates a new lock with default tuning, ready for use.
    fn new(value: Self::Target) -> Self;
}

/// A trait for lock types that can return either the underlying value (by
/// consuming the lock) or an exclusive reference to it.
#[cfg(not(loom))]
pub trait LockData: LockNew {
    /// Consumes this lock, returning the underlying data.
    fn into_inner(self) -> Self::Target;

    /// Returns a mutable reference to the underlying data.
    fn get_mut(&mut self) -> &mut Self::Target;
}

/// An arbitrary unsigned integer type.
pub type Int = u64;

/// Get a copy of the protected integer.
pub fn lock_get<L>(lock: &L) -> Int
where
    L: DelegateLock<Target = Int>,
{
    lock.lock_then(|data| *data)
}

/// Increments the protected integer.
pub fn lock_inc<L>(lock: &L)
where
    L: DelegateLock<Target = Int>,
{
    lock.lock_then(|data| *data += 1);
}

#[cfg(all(not(loom), test))]
pub mod tests {
    // Modified test suite from the Rust's Mutex implementation with minor changes
    // since the API is not compatible with this crate implementation and some
    // new tests as well.
    //
    // Copyright 2014 The Rust Project Developers.
    //
    // Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
    // http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
    // <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
    // option. This file may not be copied, modified, or distributed
    // except according to those terms.

    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::{lock_get, lock_inc, Int, LockData, LockNew};
    use crate::lock::DelegateLock;

    #[derive(Eq, PartialEq, Debug)]
    pub struct NonCopy(u32);

    pub struct Foo(Arc<AtomicUsize>);

    impl Drop for Foo {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Routes the crate's log records to the test harness output. Set
    /// `RUST_LOG` to see them.
    pub fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    const ITERS: Int = 1000;
    const THREADS: Int = 4;
    const EXPECTED_VALUE: Int = ITERS * THREADS;

    /// A lock of the shared test integer.
    pub trait IntLock:
        LockNew<Target = Int> + DelegateLock<Target = Int> + Send + Sync + 'static
    {
    }

    impl<L> IntLock for L where
        L: LockNew<Target = Int> + DelegateLock<Target = Int> + Send + Sync + 'static
    {
    }

    pub fn lots_and_lots<L: IntLock>() {
        let mutex = Arc::new(L::new(0));
        let (tx, rx) = channel();
        for _ in 0..THREADS {
            let c_mutex = Arc::clone(&mutex);
            let c_tx = tx.clone();
            thread::spawn(move || {
                for _ in 0..ITERS {
                    lock_inc(&*c_mutex);
                }
                c_tx.send(()).unwrap();
            });
        }
        drop(tx);
        for _ in 0..THREADS {
            rx.recv().unwrap();
        }
        assert_eq!(lock_get(&*mutex), EXPECTED_VALUE);
    }

    /// Every caller gets back the output of its own closure: handing out
    /// tickets yields every ticket exactly once.
    pub fn no_lost_results<L: IntLock>() {
        let mutex = Arc::new(L::new(0));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || {
                    (0..ITERS)
                        .map(|_| {
                            mutex.lock_then(|next| {
                                let ticket = *next;
                                *next += 1;
                                ticket
                            })
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut tickets: Vec<Int> = Vec::new();
        for handle in handles {
            let mine = handle.join().unwrap();
            // Tickets of a single thread are strictly increasing.
            assert!(mine.windows(2).all(|w| w[0] < w[1]));
            tickets.extend(mine);
        }
        tickets.sort_unstable();
        assert!(tickets.into_iter().eq(0..EXPECTED_VALUE));
    }

    /// No two closures ever run at the same time.
    pub fn single_executor<L: IntLock>() {
        let mutex = Arc::new(L::new(0));
        let inside = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                let inside = Arc::clone(&inside);
                let overlaps = Arc::clone(&overlaps);
                thread::spawn(move || {
                    for _ in 0..ITERS / 4 {
                        mutex.lock_then(|data| {
                            if inside.swap(true, Ordering::SeqCst) {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            for _ in 0..16 {
                                core::hint::spin_loop();
                            }
                            *data += 1;
                            inside.store(false, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(lock_get(&*mutex), EXPECTED_VALUE / 4);
    }

    pub fn smoke<L: IntLock>() {
        let mutex = L::new(1);
        assert_eq!(mutex.lock_then(|data| *data), 1);
        assert_eq!(mutex.lock_then(|data| *data), 1);
    }

    /// Closures may borrow from the caller's stack.
    pub fn borrowed_capture<L: IntLock>() {
        let mutex = L::new(0);
        let weights: Vec<Int> = (1..=10).collect();
        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for weight in &weights {
                        mutex.lock_then(|data| *data += weight);
                    }
                });
            }
        });
        let mut local = String::from("caller owned");
        let len = mutex.lock_then(|_| {
            local.push('!');
            local.len()
        });
        assert_eq!(len, local.len());
        assert_eq!(lock_get(&mutex), 55 * THREADS);
    }

    /// A panicking closure unwinds on its caller only, and the lock keeps
    /// working for everybody.
    pub fn panic_propagates<L: IntLock>() {
        let mutex = Arc::new(L::new(0));
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            mutex.lock_then(|_| panic!("delegate failed"));
        }));
        let payload = result.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"delegate failed"));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || {
                    let mut panics = 0;
                    for i in 0..100 {
                        let result = panic::catch_unwind(AssertUnwindSafe(|| {
                            mutex.lock_then(|data| {
                                assert!(i % 10 != 0, "every tenth call fails");
                                *data += 1;
                            });
                        }));
                        panics += usize::from(result.is_err());
                    }
                    panics
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 10);
        }
        assert_eq!(lock_get(&*mutex), 90 * THREADS);
    }

    /// Calling a lock from inside one of its own closures panics instead of
    /// deadlocking.
    pub fn reentrant_call_panics<L: IntLock>() {
        let mutex = Arc::new(L::new(0));
        let c_mutex = Arc::clone(&mutex);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            mutex.lock_then(move |_| lock_get(&*c_mutex))
        }));
        assert!(result.is_err());
        lock_inc(&*mutex);
        assert_eq!(lock_get(&*mutex), 1);
    }

    pub fn test_mutex_default<L>()
    where
        L: LockData<Target = Int> + Default,
    {
        let mutex: L = Default::default();
        assert_eq!(Int::default(), mutex.into_inner());
    }

    pub fn test_mutex_from<L>()
    where
        L: LockData<Target = Int> + From<Int>,
    {
        let value = 42;
        let mutex = L::from(value);
        assert_eq!(value, mutex.into_inner());
    }

    pub fn test_into_inner<M>()
    where
        M: LockData<Target = NonCopy>,
    {
        let mutex = M::new(NonCopy(10));
        assert_eq!(mutex.into_inner(), NonCopy(10));
    }

    pub fn test_into_inner_drop<M>()
    where
        M: LockData<Target = Foo>,
    {
        let num_drops = Arc::new(AtomicUsize::new(0));
        let mutex = M::new(Foo(num_drops.clone()));
        assert_eq!(num_drops.load(Ordering::SeqCst), 0);
        {
            let _inner = mutex.into_inner();
            assert_eq!(num_drops.load(Ordering::SeqCst), 0);
        }
        assert_eq!(num_drops.load(Ordering::SeqCst), 1);
    }

    pub fn test_get_mut<M>()
    where
        M: LockData<Target = NonCopy>,
    {
        let mut mutex = M::new(NonCopy(10));
        *mutex.get_mut() = NonCopy(20);
        assert_eq!(mutex.into_inner(), NonCopy(20));
    }

    pub fn test_lock_arc_nested<L1, L2>()
    where
        L1: IntLock,
        L2: LockNew<Target = Arc<L1>> + DelegateLock<Target = Arc<L1>> + Send + Sync + 'static,
    {
        // Tests nested locks and access
        // to underlying data.
        let arc1 = Arc::new(L1::new(1));
        let arc2 = Arc::new(L2::new(arc1));
        let val = thread::spawn(move || arc2.lock_then(|arc1| lock_get(&**arc1)))
            .join()
            .unwrap();
        assert_eq!(val, 1);
    }

    pub fn test_acquire_more_than_one_lock<L: IntLock>() {
        let arc = Arc::new(L::new(1));
        let mut threads = Vec::new();
        for _ in 0..4 {
            let c_arc = Arc::clone(&arc);
            let t = thread::spawn(move || {
                c_arc.lock_then(|outer| {
                    let mutex = L::new(1);
                    *outer += lock_get(&mutex);
                });
            });
            threads.push(t);
        }
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(lock_get(&*arc), 5);
    }

    pub fn test_lock_arc_access_in_unwind<L: IntLock>() {
        let arc = Arc::new(L::new(1));
        let arc2 = arc.clone();
        let _ = thread::spawn(move || {
            struct Unwinder<T: IntLock> {
                i: Arc<T>,
            }
            impl<T: IntLock> Drop for Unwinder<T> {
                fn drop(&mut self) {
                    lock_inc(&*self.i);
                }
            }
            let _u = Unwinder { i: arc2 };
            panic!();
        })
        .join();
        let value = lock_get(&*arc);
        assert_eq!(value, 2);
    }

    /// Runs threads with critical sections of different lengths against the
    /// same lock for a while and returns how unevenly the lock's time was
    /// shared, as the ratio of the largest to the smallest per thread total.
    pub fn service_spread<L: IntLock>() -> f64 {
        const RUN: Duration = Duration::from_millis(300);
        let mutex = Arc::new(L::new(0));
        let barrier = Arc::new(Barrier::new(THREADS as usize));
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let mutex = Arc::clone(&mutex);
                let barrier = Arc::clone(&barrier);
                let section = Duration::from_micros(2 * (i + 1));
                thread::spawn(move || {
                    barrier.wait();
                    let start = Instant::now();
                    let mut held = Duration::ZERO;
                    while start.elapsed() < RUN {
                        held += mutex.lock_then(|data| {
                            let begin = Instant::now();
                            while begin.elapsed() < section {
                                core::hint::spin_loop();
                            }
                            *data += 1;
                            begin.elapsed()
                        });
                    }
                    held.as_secs_f64()
                })
            })
            .collect();
        let totals: Vec<f64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let max = totals.iter().copied().fold(f64::MIN, f64::max);
        let min = totals.iter().copied().fold(f64::MAX, f64::min);
        max / min.max(f64::EPSILON)
    }
}
