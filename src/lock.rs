use core::panic::Location;

use crate::error::Error;

/// The uniform call interface shared by every lock of this crate.
///
/// A caller hands the lock a closure; the lock runs it under mutual exclusion
/// against the protected data, on the calling thread or on some other thread,
/// and returns its output. Callers cannot tell which thread ran it.
///
/// Every lock also offers these methods inherently, so this trait only needs
/// to be in scope for code that is generic over the lock type.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use dlock::{ccsynch, fc, DelegateLock};
///
/// fn count<L>(lock: Arc<L>) -> u64
/// where
///     L: DelegateLock<Target = u64> + Send + Sync + 'static,
/// {
///     let handles: Vec<_> = (0..4)
///         .map(|_| {
///             let lock = Arc::clone(&lock);
///             thread::spawn(move || lock.lock_then(|n| *n += 1))
///         })
///         .collect();
///     for handle in handles {
///         handle.join().unwrap();
///     }
///     lock.lock_then(|n| *n)
/// }
///
/// assert_eq!(count(Arc::new(fc::spins::Mutex::new(0))), 4);
/// assert_eq!(count(Arc::new(ccsynch::yields::Mutex::new(0))), 4);
/// ```
pub trait DelegateLock {
    /// The type of the protected data.
    type Target;

    /// Runs `f` against the protected data under mutual exclusion and returns
    /// its output.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock could not set up the calling thread as a
    /// participant, or rejected the request for lack of resources. In both
    /// cases `f` has not run.
    ///
    /// # Panics
    ///
    /// A panic inside `f` is resumed on the calling thread. Calling the same
    /// lock again from inside `f` panics.
    fn checked_lock_then<F, Ret>(&self, f: F) -> Result<Ret, Error>
    where
        F: FnOnce(&mut Self::Target) -> Ret + Send,
        Ret: Send;

    /// Runs `f` against the protected data under mutual exclusion and returns
    /// its output.
    ///
    /// # Panics
    ///
    /// Panics wherever [`checked_lock_then`] would return an error, and
    /// whenever it panics.
    ///
    /// [`checked_lock_then`]: DelegateLock::checked_lock_then
    #[track_caller]
    fn lock_then<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(&mut Self::Target) -> Ret + Send,
        Ret: Send,
    {
        self.checked_lock_then(f).unwrap_or_else(|err| panic_lock_failed(&err, Location::caller()))
    }
}

/// Panics the thread with a message pointing to the panic location.
#[inline(never)]
#[cold]
pub(crate) fn panic_lock_failed(err: &Error, caller: &Location<'static>) -> ! {
    panic!("delegated call failed: {err}, at: {caller}")
}

/// Implements the conversion and delegation boilerplate of a lock type that
/// has inherent `new`, `checked_lock_then`, `lock_then` and `into_inner`.
macro_rules! impl_delegate_lock {
    ($mutex:ident) => {
        impl<T, R: $crate::relax::Relax> $crate::lock::DelegateLock for $mutex<T, R> {
            type Target = T;

            #[track_caller]
            fn checked_lock_then<F, Ret>(&self, f: F) -> Result<Ret, $crate::Error>
            where
                F: FnOnce(&mut T) -> Ret + Send,
                Ret: Send,
            {
                $mutex::checked_lock_then(self, f)
            }

            #[track_caller]
            fn lock_then<F, Ret>(&self, f: F) -> Ret
            where
                F: FnOnce(&mut T) -> Ret + Send,
                Ret: Send,
            {
                $mutex::lock_then(self, f)
            }
        }

        impl<T: Default, R> Default for $mutex<T, R> {
            /// Creates a `Mutex<T, R>`, with the `Default` value for `T`.
            fn default() -> Self {
                Self::new(Default::default())
            }
        }

        impl<T, R> From<T> for $mutex<T, R> {
            /// Creates a `Mutex<T, R>` from an instance of `T`.
            fn from(data: T) -> Self {
                Self::new(data)
            }
        }
    };
}

pub(crate) use impl_delegate_lock;
