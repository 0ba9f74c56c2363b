//! Combiner election for the publication list based locks.
//!
//! A caller publishes its request, makes sure its record is linked and then
//! races for the combiner flag. The winner runs one combine pass over the
//! list and releases the flag. Losers spin on their own request for a bounded
//! number of rounds, yield, and race again; they return as soon as some
//! combiner has consumed their request.

use core::fmt;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crate::cfg::atomic::AtomicBool;
use crate::config::Config;
use crate::delegate::Task;
use crate::error::Error;
use crate::publication::{Node, PublicationList};
use crate::relax::{self, Relax};

/// The right to run combine passes over a lock's publication list.
pub(crate) struct CombinerFlag(AtomicBool);

impl CombinerFlag {
    pub(crate) fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Tries to become the combiner. Reads before it writes so that losers
    /// do not keep stealing the cache line from the winner.
    pub(crate) fn try_acquire(&self) -> bool {
        !self.0.load(Relaxed) && self.0.compare_exchange(false, true, Acquire, Relaxed).is_ok()
    }

    /// Gives the combining right up. Only the winner of `try_acquire` may
    /// call this.
    pub(crate) fn release(&self) {
        self.0.store(false, Release);
    }

    /// Returns `true` if some thread is combining right now.
    pub(crate) fn is_held(&self) -> bool {
        self.0.load(Relaxed)
    }
}

impl fmt::Debug for CombinerFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CombinerFlag").field(&self.is_held()).finish()
    }
}

/// A lock whose combiner scans a [`PublicationList`].
pub(crate) trait Combine {
    /// The protected data.
    type Data;

    /// Per-record state of the lock's fairness policy.
    type Ext: Default + Send;

    fn list(&self) -> &PublicationList<Self::Data, Self::Ext>;

    fn flag(&self) -> &CombinerFlag;

    /// Serves pending requests found on the list.
    ///
    /// # Safety
    ///
    /// Caller must hold the combiner flag.
    unsafe fn combine_pass(&self);

    /// Error reported to a caller whose request a pass rejected. Locks that
    /// never reject requests keep the default.
    fn rejection(&self) -> Error {
        Error::QueueGrowth { capacity: 0 }
    }
}

/// Publishes `f` through `node` and blocks until a combiner, possibly the
/// calling thread, has executed it.
#[track_caller]
pub(crate) fn delegate<C, R, F, Ret>(
    lock: &C,
    node: &Node<C::Data, C::Ext>,
    spin_limit: u32,
    f: F,
) -> Result<Ret, Error>
where
    C: Combine,
    R: Relax,
    F: FnOnce(&mut C::Data) -> Ret,
{
    let _entered = node.entered.enter();
    let mut task = Task::new(f);
    // SAFETY: The slot is idle since the owner is not inside another call,
    // and `acquire_or_delegate` returns only once it is no longer pending.
    unsafe { node.slot.publish(task.erase()) };
    acquire_or_delegate::<C, R>(lock, node, spin_limit);
    if node.slot.finish() {
        Ok(task.into_output())
    } else {
        Err(lock.rejection())
    }
}

/// Runs the election loop until `node`'s request is no longer pending.
fn acquire_or_delegate<C, R>(lock: &C, node: &Node<C::Data, C::Ext>, spin_limit: u32)
where
    C: Combine,
    R: Relax,
{
    loop {
        lock.list().ensure_registered(node);
        if lock.flag().try_acquire() {
            // SAFETY: We just won the combiner flag.
            unsafe { lock.combine_pass() };
            lock.flag().release();
            // A pass may skip or miss our request, so only return once it
            // has really been consumed.
            if !node.slot.is_pending() {
                return;
            }
            continue;
        }
        if relax::spin_then_yield::<R, _>(spin_limit, || !node.slot.is_pending()) {
            return;
        }
    }
}

/// Every cleanup period, unlinks records that were last served more than the
/// configured age ago and are not `busy`. Records with a pending request are
/// always kept.
///
/// # Safety
///
/// Caller must hold the combiner flag.
pub(crate) unsafe fn evict_idle<T, E, B>(
    list: &PublicationList<T, E>,
    pass: u32,
    config: &Config,
    mut busy: B,
) where
    B: FnMut(&Node<T, E>) -> bool,
{
    if pass % config.cleanup_period != 0 {
        return;
    }
    // SAFETY: Caller holds the combiner flag.
    let unlinked = unsafe {
        list.retain(|node| {
            node.slot.is_pending()
                || busy(node)
                || pass.wrapping_sub(node.age()) <= config.cleanup_age
        })
    };
    if unlinked > 0 {
        log::trace!("pass {pass}: unlinked {unlinked} idle participants");
    }
}

/// Counts the records currently linked into `lock`'s list.
#[cfg(all(not(loom), test))]
pub(crate) fn count_registered<C: Combine>(lock: &C) -> usize {
    while !lock.flag().try_acquire() {
        std::thread::yield_now();
    }
    let mut count = 0;
    // SAFETY: We hold the combiner flag.
    unsafe { lock.list().for_each(|_| count += 1) };
    lock.flag().release();
    count
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::CombinerFlag;

    #[test]
    fn flag_is_exclusive() {
        let flag = CombinerFlag::new();
        assert!(!flag.is_held());
        assert!(flag.try_acquire());
        assert!(flag.is_held());
        assert!(!flag.try_acquire());
        flag.release();
        assert!(!flag.is_held());
        assert!(flag.try_acquire());
    }

    #[test]
    fn one_winner_among_many() {
        let flag = Arc::new(CombinerFlag::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let flag = Arc::clone(&flag);
                thread::spawn(move || flag.try_acquire())
            })
            .collect();
        let winners = handles.into_iter().map(|h| h.join().unwrap());
        assert_eq!(winners.filter(|won| *won).count(), 1);
    }
}
