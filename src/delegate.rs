//! Type erased units of work and the request slot they are published through.
//!
//! A caller wraps its closure in a [`Task`] that lives on its own stack, erases
//! it to a [`RawJob`] and publishes that pointer into a [`Slot`]. Whichever
//! thread ends up executing the job writes the output back into the task and
//! then clears the slot with release ordering. The caller never returns before
//! observing the cleared slot with acquire ordering, which is what keeps the
//! erased pointer valid for as long as any other thread can reach it.

use core::cell::UnsafeCell;
use core::fmt;
use core::mem;
use core::ptr::NonNull;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crate::cfg::atomic::AtomicU8;

/// A unit of work executed against the protected data of type `T`.
pub(crate) trait Job<T> {
    /// Runs the work. Calling it more than once is a no-op.
    fn run(&mut self, data: &mut T);
}

/// A lifetime erased pointer to a [`Job`] that lives on some caller's stack.
pub(crate) type RawJob<T> = NonNull<dyn Job<T>>;

/// Erases the lifetime of a job borrowed from some caller's stack.
///
/// # Safety
///
/// The returned pointer must not be dereferenced after the borrow ends.
pub(crate) unsafe fn erase<'a, T>(job: &'a mut (dyn Job<T> + 'a)) -> RawJob<T> {
    let job = NonNull::from(job);
    // SAFETY: Only the trait object lifetime bound changes, the pointer
    // layout is the same.
    unsafe { mem::transmute::<NonNull<dyn Job<T> + 'a>, RawJob<T>>(job) }
}

/// A closure together with the slot its output is written to.
pub(crate) struct Task<F, Ret> {
    f: Option<F>,
    output: Option<thread::Result<Ret>>,
}

impl<F, Ret> Task<F, Ret> {
    /// Wraps `f` so it can be handed to another thread for execution.
    pub(crate) const fn new(f: F) -> Self {
        Self { f: Some(f), output: None }
    }

    /// Erases both the closure type and its lifetime.
    ///
    /// # Safety
    ///
    /// The returned pointer must not be dereferenced after `self` is moved or
    /// dropped. Callers guarantee this by blocking until the job has been
    /// executed or discarded.
    pub(crate) unsafe fn erase<T>(&mut self) -> RawJob<T>
    where
        F: FnOnce(&mut T) -> Ret,
    {
        // SAFETY: Caller guarantees the pointer does not outlive this task.
        unsafe { erase(self) }
    }

    /// Returns the closure's output, resuming its panic if it unwound.
    ///
    /// # Panics
    ///
    /// Panics if the job was never executed, which would be a bug in the lock
    /// that returned control to the caller.
    pub(crate) fn into_output(self) -> Ret {
        match self.output {
            Some(Ok(ret)) => ret,
            Some(Err(payload)) => panic::resume_unwind(payload),
            None => unreachable!("delegated job returned without running"),
        }
    }
}

impl<T, F, Ret> Job<T> for Task<F, Ret>
where
    F: FnOnce(&mut T) -> Ret,
{
    fn run(&mut self, data: &mut T) {
        if let Some(f) = self.f.take() {
            // The panic is resumed on the submitting thread. The executing
            // thread carries on serving other requests.
            self.output = Some(panic::catch_unwind(AssertUnwindSafe(|| f(data))));
        }
    }
}

const IDLE: u8 = 0;
const PENDING: u8 = 1;
const REJECTED: u8 = 2;

/// A single-request mailbox owned by one thread and drained by whichever
/// thread holds the right to execute it.
///
/// The owner writes the job and then moves the state from idle to pending with
/// release ordering. The executor reads the job only after observing pending
/// with acquire ordering, and clears the state with release ordering once the
/// job's output has been written.
pub(crate) struct Slot<T> {
    state: AtomicU8,
    job: UnsafeCell<Option<RawJob<T>>>,
}

impl<T> Slot<T> {
    /// Creates an idle slot.
    pub(crate) fn new() -> Self {
        Self { state: AtomicU8::new(IDLE), job: UnsafeCell::new(None) }
    }

    /// Publishes `job` and marks the slot as pending.
    ///
    /// # Safety
    ///
    /// Only the owner of the slot may publish, and only while the slot is not
    /// pending. The job must stay valid until [`Slot::is_pending`] returns
    /// `false` for the owner.
    pub(crate) unsafe fn publish(&self, job: RawJob<T>) {
        // SAFETY: The slot is not pending, so no executor reads the job cell.
        unsafe { *self.job.get() = Some(job) };
        self.state.store(PENDING, Release);
    }

    /// Returns `true` if a published job has not been consumed yet.
    pub(crate) fn is_pending(&self) -> bool {
        self.state.load(Acquire) == PENDING
    }

    /// Runs the pending job against `data` and clears the slot.
    ///
    /// # Safety
    ///
    /// Caller must hold the exclusive right to execute this slot's requests
    /// and must have observed [`Slot::is_pending`] returning `true` since.
    pub(crate) unsafe fn execute(&self, data: &mut T) {
        // SAFETY: Same requirements.
        unsafe { self.execute_then(data, || ()) }
    }

    /// Runs the pending job against `data`, calls `release` and only then
    /// clears the slot, while the owner is still blocked.
    ///
    /// # Safety
    ///
    /// Same as [`Slot::execute`].
    pub(crate) unsafe fn execute_then<F: FnOnce()>(&self, data: &mut T, release: F) {
        // SAFETY: Caller holds the execution right and observed the pending
        // state, which synchronizes with the owner's publication.
        if let Some(mut job) = unsafe { (*self.job.get()).take() } {
            // SAFETY: The owner is blocked until the state leaves pending.
            unsafe { job.as_mut() }.run(data);
        }
        release();
        self.state.store(IDLE, Release);
    }

    /// Drops the pending job without running it, so the owner observes a
    /// rejection.
    ///
    /// # Safety
    ///
    /// Same as [`Slot::execute`].
    pub(crate) unsafe fn reject(&self) {
        // SAFETY: Same as execute.
        unsafe { *self.job.get() = None };
        self.state.store(REJECTED, Release);
    }

    /// Returns the slot to idle once the owner has seen it leave the pending
    /// state. Returns `false` if the job was rejected instead of executed.
    ///
    /// Only the owner may call this.
    pub(crate) fn finish(&self) -> bool {
        let state = self.state.load(Acquire);
        self.state.store(IDLE, Relaxed);
        state != REJECTED
    }
}

impl<T> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot").field("pending", &self.is_pending()).finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::panic::{self, AssertUnwindSafe};

    use super::{Job, Slot, Task};

    #[test]
    fn task_runs_once() {
        let mut calls = 0;
        let mut task = Task::new(|data: &mut u32| {
            calls += 1;
            *data += 1;
            *data
        });
        let mut data = 41;
        task.run(&mut data);
        task.run(&mut data);
        assert_eq!(task.into_output(), 42);
        assert_eq!(data, 42);
        assert_eq!(calls, 1);
    }

    #[test]
    fn task_resumes_panic() {
        let mut task = Task::new(|_: &mut u32| -> u32 { panic!("boom") });
        task.run(&mut 0);
        let result = panic::catch_unwind(AssertUnwindSafe(|| task.into_output()));
        let payload = result.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
    }

    #[test]
    fn slot_execute_then_finish() {
        let slot = Slot::<u32>::new();
        let mut task = Task::new(|data: &mut u32| *data * 2);
        assert!(!slot.is_pending());
        unsafe { slot.publish(task.erase()) };
        assert!(slot.is_pending());
        unsafe { slot.execute(&mut 21) };
        assert!(!slot.is_pending());
        assert!(slot.finish());
        assert_eq!(task.into_output(), 42);
    }

    #[test]
    fn slot_reject_then_finish() {
        let slot = Slot::<u32>::new();
        let mut task = Task::new(|data: &mut u32| *data);
        unsafe { slot.publish(task.erase()) };
        unsafe { slot.reject() };
        assert!(!slot.is_pending());
        assert!(!slot.finish());
        // The slot is reusable after a rejection.
        unsafe { slot.publish(task.erase()) };
        unsafe { slot.execute(&mut 7) };
        assert!(slot.finish());
        assert_eq!(task.into_output(), 7);
    }
}
