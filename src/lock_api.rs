//! Locking interfaces for the ticket lock that are compatible with
//! [lock_api].
//!
//! This module exports [`lock_api::Mutex`] and [`lock_api::MutexGuard`]
//! aliases with [`RawTicketLock`] as their raw lock. The combining locks of
//! this crate run closures instead of handing out guards and have no
//! `lock_api` counterpart.
//!
//! [lock_api]: https://crates.io/crates/lock_api
//! [`lock_api::Mutex`]: https://docs.rs/lock_api/latest/lock_api/struct.Mutex.html
//! [`lock_api::MutexGuard`]: https://docs.rs/lock_api/latest/lock_api/struct.MutexGuard.html
//! [`RawTicketLock`]: crate::ticket::RawTicketLock

use crate::ticket::RawTicketLock;

/// A ticket lock that is compatible with
/// [`lock_api`](https://crates.io/crates/lock_api).
pub type Mutex<T, R> = lock_api::Mutex<RawTicketLock<R>, T>;

/// A guard of a [`Mutex`].
pub type MutexGuard<'a, T, R> = lock_api::MutexGuard<'a, RawTicketLock<R>, T>;

/// Ticket lock aliases that spin while waiting for their turn.
pub mod spins {
    use crate::relax::Spin;

    /// A ticket lock that implements the [`Spin`] relax strategy.
    ///
    /// # Example
    ///
    /// ```
    /// use dlock::lock_api::spins::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// *mutex.lock() += 1;
    /// assert_eq!(*mutex.lock(), 1);
    /// ```
    pub type Mutex<T> = super::Mutex<T, Spin>;

    /// A guard of a [`Mutex`].
    pub type MutexGuard<'a, T> = super::MutexGuard<'a, T, Spin>;
}

/// Ticket lock aliases that yield to the scheduler while waiting for their
/// turn.
pub mod yields {
    use crate::relax::Yield;

    /// A ticket lock that implements the [`Yield`] relax strategy.
    ///
    /// # Example
    ///
    /// ```
    /// use dlock::lock_api::yields::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// *mutex.lock() += 1;
    /// assert_eq!(*mutex.lock(), 1);
    /// ```
    pub type Mutex<T> = super::Mutex<T, Yield>;

    /// A guard of a [`Mutex`].
    pub type MutexGuard<'a, T> = super::MutexGuard<'a, T, Yield>;
}
