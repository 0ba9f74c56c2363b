//! Remote core locking.
//!
//! Critical sections never run on the calling thread. A [`Server`] owns a
//! table with one request record per client thread and a small pool of
//! serving threads that scan the table round after round. A serving thread
//! that finds a pending request claims the targeted lock through its holder
//! field, runs the request and releases the lock, so any number of
//! [`Mutex`]es can share one server while their critical sections stay
//! mutually exclusive per lock.
//!
//! A management thread wakes up every [`ServerConfig::tick`]. If no serving
//! thread completed a round in the meantime and none of them is free, every
//! serving thread is stuck inside a critical section, so it wakes a parked
//! serving thread or spawns a new one, up to [`ServerConfig::max_threads`].
//! Serving threads that keep finding nothing to do while others serve too
//! park themselves until needed again.
//!
//! When a critical section calls into another lock of the same server, the
//! serving thread running it takes that lock directly instead of submitting
//! a request it would have to serve itself.
//!
//! [`ServerConfig::tick`]: crate::ServerConfig::tick
//! [`ServerConfig::max_threads`]: crate::ServerConfig::max_threads

mod mutex;
mod request;
mod server;

pub use mutex::Mutex;
pub use server::Server;

/// A remote core lock whose waiters spin while their request is pending.
pub mod spins {
    /// A [`rcl::Mutex`](crate::rcl::Mutex) with the [`Spin`](crate::relax::Spin)
    /// relax policy.
    pub type Mutex<T> = super::Mutex<T, crate::relax::Spin>;
}

/// A remote core lock whose waiting clients yield on every spin round.
pub mod yields {
    /// A [`rcl::Mutex`](crate::rcl::Mutex) with the
    /// [`Yield`](crate::relax::Yield) relax policy.
    pub type Mutex<T> = super::Mutex<T, crate::relax::Yield>;
}
