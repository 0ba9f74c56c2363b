//! A single-token thread parker.
//!
//! Spare RCL serving threads block on their own [`Parker`] until the
//! management thread hands them a token. A token handed out before the owner
//! starts waiting is kept, so a wake-up is never lost.

#[cfg(not(all(loom, test)))]
pub(crate) use common::Parker;

#[cfg(all(loom, test))]
pub(crate) use loom::Parker;

#[cfg(not(all(loom, test)))]
mod common {
    use core::ptr;
    use core::sync::atomic::AtomicU32;
    use core::sync::atomic::Ordering::{Acquire, Release};

    const EMPTY: u32 = 0;
    const NOTIFIED: u32 = 1;

    /// Parks the calling thread on a `futex` compatible word, with the
    /// platform calls provided by `atomic_wait`.
    #[derive(Debug)]
    pub(crate) struct Parker {
        state: AtomicU32,
    }

    impl Parker {
        pub(crate) const fn new() -> Self {
            Self { state: AtomicU32::new(EMPTY) }
        }

        /// Blocks until a token is available, then consumes it.
        ///
        /// Spurious wake-ups are absorbed: the caller only returns once
        /// [`Parker::wake_one`] has been called.
        pub(crate) fn wait(&self) {
            while self.state.swap(EMPTY, Acquire) != NOTIFIED {
                atomic_wait::wait(&self.state, EMPTY);
            }
        }

        /// Makes the token available and wakes the owner if it is blocked.
        pub(crate) fn wake_one(&self) {
            let state = &self.state;
            let ptr = ptr::addr_of!(*state);
            state.store(NOTIFIED, Release);
            atomic_wait::wake_one(ptr);
        }

        /// Returns `true` if a token is waiting to be consumed.
        #[cfg(test)]
        pub(crate) fn is_notified(&self) -> bool {
            self.state.load(core::sync::atomic::Ordering::Relaxed) == NOTIFIED
        }
    }
}

#[cfg(all(loom, test))]
#[cfg(not(tarpaulin_include))]
mod loom {
    use core::sync::atomic::Ordering::{Acquire, Release};

    use loom::sync::atomic::AtomicBool;
    use loom::thread;

    /// Loom cannot model `futex` calls, so waiting yields instead.
    #[derive(Debug)]
    pub(crate) struct Parker {
        notified: AtomicBool,
    }

    impl Parker {
        pub(crate) fn new() -> Self {
            Self { notified: AtomicBool::new(false) }
        }

        pub(crate) fn wait(&self) {
            while !self.notified.swap(false, Acquire) {
                thread::yield_now();
            }
        }

        pub(crate) fn wake_one(&self) {
            self.notified.store(true, Release);
            thread::yield_now();
        }
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::Parker;

    #[test]
    fn token_before_wait_is_kept() {
        let parker = Parker::new();
        parker.wake_one();
        assert!(parker.is_notified());
        parker.wait();
        assert!(!parker.is_notified());
    }

    #[test]
    fn wakes_blocked_thread() {
        let parker = Arc::new(Parker::new());
        let woken = Arc::new(AtomicBool::new(false));
        let handle = {
            let parker = Arc::clone(&parker);
            let woken = Arc::clone(&woken);
            thread::spawn(move || {
                parker.wait();
                woken.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!woken.load(Ordering::SeqCst));
        parker.wake_one();
        handle.join().unwrap();
        assert!(woken.load(Ordering::SeqCst));
    }
}

#[cfg(all(loom, test))]
mod model {
    use crate::loom::models;

    #[test]
    fn parker_handoff() {
        models::parker_handoff();
    }
}
