//! Strategies that determine how waiters behave while their request is
//! pending.
//!
//! Every lock in this crate makes a waiting thread spin on its own request
//! record for a bounded number of rounds (see [`Config::spin_limit`]) and then
//! yield its time slice before trying again. The relax policy decides what a
//! single spin round does.
//!
//! [`Config::spin_limit`]: crate::Config::spin_limit

use crate::cfg::{hint, thread};

/// A trait implemented by spinning relax strategies.
pub trait Relax {
    /// Initialize the state for the relaxing operation, if any.
    fn new() -> Self;

    /// Perform the relaxing operation during one round of waiting.
    fn relax(&mut self);
}

/// A strategy that rapidly spins while informing the CPU that it should power
/// down non-essential components via [`core::hint::spin_loop`].
///
/// This is the default policy of every lock. Waiters still yield to the
/// scheduler once their spin budget runs out, so a preempted combiner is
/// eventually scheduled again.
#[derive(Debug)]
pub struct Spin;

impl Relax for Spin {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {
        hint::spin_loop();
    }
}

/// A strategy that yields the current time slice to the scheduler on every
/// round.
///
/// Useful when there are more threads than cores, since the combiner then
/// competes for CPU time with the threads it is serving.
#[derive(Debug)]
pub struct Yield;

impl Relax for Yield {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline]
    fn relax(&mut self) {
        thread::yield_now();
    }
}

/// A strategy that performs exponential backoff, spinning at first and then
/// yielding once the backoff has grown past its spin threshold.
///
/// This is a thin wrapper over [`crossbeam_utils::Backoff::snooze`].
#[derive(Debug)]
pub struct Backoff {
    inner: crossbeam_utils::Backoff,
}

impl Relax for Backoff {
    #[inline]
    fn new() -> Self {
        Self { inner: crossbeam_utils::Backoff::new() }
    }

    #[inline]
    fn relax(&mut self) {
        self.inner.snooze();
    }
}

/// Spins `limit` rounds under the `R` policy waiting for `done` to return
/// `true`, then yields once and reports the final observation.
pub(crate) fn spin_then_yield<R, F>(limit: u32, mut done: F) -> bool
where
    R: Relax,
    F: FnMut() -> bool,
{
    let mut relax = R::new();
    for _ in 0..limit {
        if done() {
            return true;
        }
        relax.relax();
    }
    thread::yield_now();
    done()
}

#[cfg(all(not(loom), test))]
mod test {
    use core::cell::Cell;

    use super::{spin_then_yield, Backoff, Relax, Spin, Yield};

    fn relax_many<R: Relax>() {
        let mut relax = R::new();
        for _ in 0..64 {
            relax.relax();
        }
    }

    #[test]
    fn policies_make_progress() {
        relax_many::<Spin>();
        relax_many::<Yield>();
        relax_many::<Backoff>();
    }

    #[test]
    fn spin_then_yield_stops_early() {
        let calls = Cell::new(0);
        let done = spin_then_yield::<Spin, _>(100, || {
            calls.set(calls.get() + 1);
            calls.get() == 3
        });
        assert!(done);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn spin_then_yield_gives_up_after_limit() {
        let calls = Cell::new(0);
        let done = spin_then_yield::<Spin, _>(10, || {
            calls.set(calls.get() + 1);
            false
        });
        assert!(!done);
        // Ten rounds plus the final observation after yielding.
        assert_eq!(calls.get(), 11);
    }
}
