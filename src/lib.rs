//! Delegation locks, where the thread that wins the lock runs the critical
//! sections of the threads waiting on it.
//!
//! With a regular mutex, every thread that wants to touch the protected data
//! acquires the lock and pulls the data into its own cache. Under contention
//! the data and the lock word keep bouncing between cores. A delegation lock
//! takes a closure instead of handing out a guard: waiting threads publish
//! their closure and one thread, the combiner or a dedicated server thread,
//! executes the published closures back to back while the data stays hot in
//! its cache.
//!
//! This crate provides these algorithms:
//!
//! - [`fc`]: flat combining. Waiters publish their request in a per-thread
//!   record linked into a publication list; whoever wins the combiner flag
//!   scans the list and serves every pending request.
//! - [`fcf`]: fair flat combining with banning. Participants that were just
//!   served are banned for a time proportional to their critical section
//!   length and the number of waiters.
//! - [`fcfpq`]: fair flat combining with a priority queue. The combiner
//!   serves the participants that used the lock the least first, within a
//!   per pass time budget.
//! - [`ccsynch`]: CC-Synch. Requests form a queue of nodes, like an MCS lock,
//!   and the thread at the head serves a bounded number of its successors.
//! - [`rcl`]: remote core locking. Critical sections always run on the
//!   serving threads of a [`rcl::Server`].
//! - [`ticket`]: a ticket lock that runs closures on the calling thread, as a
//!   baseline to measure the others against.
//!
//! Every lock implements [`DelegateLock`], so code can be generic over the
//! algorithm.
//!
//! ## Calling convention
//!
//! A closure passed to [`lock_then`] runs exactly once, under mutual
//! exclusion, and its output is returned to the caller. It may run on another
//! thread, so both the closure and its output must be [`Send`]. The closure
//! may borrow from the caller's stack: the caller does not return before it
//! ran. A panic inside the closure is resumed on the caller and does not
//! poison the lock.
//!
//! Calling a lock again from inside one of its own closures is a bug that
//! would deadlock. The combining locks and [`rcl`] detect it and panic
//! instead; [`ticket`] does not and deadlocks.
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//!
//! use dlock::fc::spins::Mutex;
//!
//! let mutex = Arc::new(Mutex::new(0));
//! let handles: Vec<_> = (0..8)
//!     .map(|_| {
//!         let mutex = Arc::clone(&mutex);
//!         thread::spawn(move || {
//!             for _ in 0..100 {
//!                 mutex.lock_then(|n| *n += 1);
//!             }
//!         })
//!     })
//!     .collect();
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//! assert_eq!(mutex.lock_then(|n| *n), 800);
//! ```
//!
//! ## Waiting policies
//!
//! Each lock takes a relax policy type parameter from the [`relax`] module.
//! Waiters spin on their own request under that policy for
//! [`Config::spin_limit`] rounds and then yield the processor before checking
//! again, so a preempted combiner is not starved by its waiters. Every lock
//! module has `spins` and `yields` aliases that fix the policy.
//!
//! ## Features
//!
//! This crate does not provide any default features. Features that can be
//! enabled are:
//!
//! ### lock_api
//!
//! Implements [`lock_api::RawMutex`] for the ticket lock and exposes the
//! resulting guard based mutex under the [`lock_api`][`crate::lock_api`]
//! module.
//!
//! [`lock_then`]: DelegateLock::lock_then
//! [`lock_api::RawMutex`]: https://docs.rs/lock_api/latest/lock_api/trait.RawMutex.html

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

pub mod ccsynch;
pub mod fc;
pub mod fcf;
pub mod fcfpq;
pub mod rcl;
pub mod relax;
pub mod stack;
pub mod ticket;

#[cfg(all(feature = "lock_api", not(loom)))]
#[cfg_attr(docsrs, doc(cfg(feature = "lock_api")))]
pub mod lock_api;

mod cfg;
mod config;
mod delegate;
mod election;
mod error;
mod fairness;
mod lock;
mod park;
mod publication;
mod registry;

pub use config::{Config, ServerConfig};
pub use error::Error;
pub use lock::DelegateLock;

#[cfg(test)]
pub(crate) mod test;

#[cfg(all(loom, test))]
#[cfg(not(tarpaulin))]
pub(crate) mod loom;
