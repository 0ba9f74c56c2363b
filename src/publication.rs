//! The publication list shared by the flat combining locks.
//!
//! Participants prepend their own record with a CAS on the list head and never
//! remove it themselves. Only the thread holding the combining right unlinks
//! records, and it only unlinks records that carry no pending request. An
//! unlinked record is marked inactive so its owner splices it back in on its
//! next call.

use core::cell::UnsafeCell;
use core::fmt;
use core::ptr;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crate::cfg::atomic::{AtomicBool, AtomicPtr};
use crate::delegate::Slot;
use crate::registry::Entered;

/// A participant record of a flat combining lock.
///
/// `E` carries the per-record state of a fairness policy. Like `age`, it is
/// only ever accessed by the thread holding the combining right.
pub(crate) struct Node<T, E> {
    pub(crate) slot: Slot<T>,
    pub(crate) entered: Entered,
    active: AtomicBool,
    next: AtomicPtr<Node<T, E>>,
    age: UnsafeCell<u32>,
    ext: UnsafeCell<E>,
}

// SAFETY: The raw job pointer inside the slot is only dereferenced under the
// slot protocol, and `age` and `ext` are only accessed by the combiner. The
// record never owns a `T`, so the data's bounds are left to the lock.
unsafe impl<T, E: Send> Send for Node<T, E> {}
// SAFETY: Same as above.
unsafe impl<T, E: Send> Sync for Node<T, E> {}

impl<T, E: Default> Node<T, E> {
    /// Creates an inactive record.
    pub(crate) fn new() -> Self {
        Self {
            slot: Slot::new(),
            entered: Entered::new(),
            active: AtomicBool::new(false),
            next: AtomicPtr::new(ptr::null_mut()),
            age: UnsafeCell::new(0),
            ext: UnsafeCell::new(E::default()),
        }
    }
}

impl<T, E> Node<T, E> {
    /// Returns `true` if the record is linked into its list.
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Acquire)
    }

    /// Returns the pass this record was last served on.
    ///
    /// # Safety
    ///
    /// Caller must hold the combining right.
    pub(crate) unsafe fn age(&self) -> u32 {
        // SAFETY: Caller holds the combining right.
        unsafe { *self.age.get() }
    }

    /// Records the pass this record was served on.
    ///
    /// # Safety
    ///
    /// Caller must hold the combining right.
    pub(crate) unsafe fn set_age(&self, pass: u32) {
        // SAFETY: Caller holds the combining right.
        unsafe { *self.age.get() = pass };
    }

    /// Returns the policy state of this record.
    ///
    /// # Safety
    ///
    /// Caller must hold the combining right and must not let the returned
    /// reference overlap with another one to the same record.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn ext(&self) -> &mut E {
        // SAFETY: Caller holds the combining right and upholds uniqueness.
        unsafe { &mut *self.ext.get() }
    }
}

impl<T, E> fmt::Debug for Node<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("active", &self.active.load(Relaxed))
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

/// An insert-only list of participant records, pruned by the combiner.
pub(crate) struct PublicationList<T, E> {
    head: AtomicPtr<Node<T, E>>,
}

impl<T, E> PublicationList<T, E> {
    /// Creates an empty list.
    pub(crate) fn new() -> Self {
        Self { head: AtomicPtr::new(ptr::null_mut()) }
    }

    /// Links `node` at the head of the list unless it is already active.
    ///
    /// Only the owner of `node` may call this, and `node` must stay allocated
    /// for as long as the list is in use.
    pub(crate) fn ensure_registered(&self, node: &Node<T, E>) {
        if node.is_active() {
            return;
        }
        // The record is marked active before it becomes reachable, so a
        // later unlink by a combiner can never be overwritten by this store.
        node.active.store(true, Relaxed);
        let new = node as *const Node<T, E> as *mut Node<T, E>;
        let mut head = self.head.load(Relaxed);
        loop {
            node.next.store(head, Relaxed);
            // Release publishes `next` and `active` together with the record.
            match self.head.compare_exchange_weak(head, new, Release, Relaxed) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Calls `f` on every linked record, head first.
    ///
    /// # Safety
    ///
    /// Caller must hold the combining right, so that no record is unlinked
    /// during the walk. Records pushed concurrently may or may not be seen.
    pub(crate) unsafe fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Node<T, E>),
    {
        let mut cur = self.head.load(Acquire);
        // SAFETY: Linked records are never freed while the list is in use.
        while let Some(node) = unsafe { cur.as_ref() } {
            f(node);
            cur = node.next.load(Acquire);
        }
    }

    /// Unlinks every record after the head for which `keep` returns `false`,
    /// and marks it inactive. Returns the number of unlinked records.
    ///
    /// The head itself is never unlinked since concurrent pushes race on it.
    ///
    /// # Safety
    ///
    /// Caller must hold the combining right.
    pub(crate) unsafe fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&Node<T, E>) -> bool,
    {
        let head = self.head.load(Acquire);
        // SAFETY: Linked records are never freed while the list is in use.
        let Some(mut prev) = (unsafe { head.as_ref() }) else { return 0 };
        let mut cur = prev.next.load(Acquire);
        let mut unlinked = 0;
        // SAFETY: Same as above.
        while let Some(node) = unsafe { cur.as_ref() } {
            let next = node.next.load(Acquire);
            if keep(node) {
                prev = node;
            } else {
                prev.next.store(next, Release);
                // The owner may relink and overwrite `next` right after this
                // store, so `next` was read before it.
                node.active.store(false, Release);
                unlinked += 1;
            }
            cur = next;
        }
        unlinked
    }
}

impl<T, E> fmt::Debug for PublicationList<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicationList").finish_non_exhaustive()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::{Node, PublicationList};

    type TestNode = Node<u32, ()>;

    fn linked(list: &PublicationList<u32, ()>) -> Vec<*const TestNode> {
        let mut nodes = Vec::new();
        unsafe { list.for_each(|node| nodes.push(node as *const _)) };
        nodes
    }

    #[test]
    fn registration_is_idempotent() {
        let list = PublicationList::new();
        let node = TestNode::new();
        assert!(!node.is_active());
        list.ensure_registered(&node);
        list.ensure_registered(&node);
        assert!(node.is_active());
        assert_eq!(linked(&list), [&node as *const _]);
    }

    #[test]
    fn prepends_in_registration_order() {
        let list = PublicationList::new();
        let nodes: Vec<TestNode> = (0..3).map(|_| TestNode::new()).collect();
        for node in &nodes {
            list.ensure_registered(node);
        }
        let expected: Vec<_> = nodes.iter().rev().map(|n| n as *const _).collect();
        assert_eq!(linked(&list), expected);
    }

    #[test]
    fn retain_unlinks_all_but_head() {
        let list = PublicationList::new();
        let nodes: Vec<TestNode> = (0..4).map(|_| TestNode::new()).collect();
        for node in &nodes {
            list.ensure_registered(node);
        }
        let unlinked = unsafe { list.retain(|_| false) };
        assert_eq!(unlinked, 3);
        assert_eq!(linked(&list), [&nodes[3] as *const _]);
        assert!(nodes[3].is_active());
        assert!(nodes[..3].iter().all(|node| !node.is_active()));

        // Deactivated records splice themselves back in.
        list.ensure_registered(&nodes[0]);
        assert_eq!(linked(&list), [&nodes[0] as *const _, &nodes[3] as *const _]);
    }

    #[test]
    fn retain_keeps_selected() {
        let list = PublicationList::new();
        let nodes: Vec<TestNode> = (0..5).map(|_| TestNode::new()).collect();
        for node in &nodes {
            list.ensure_registered(node);
        }
        let odd = &nodes[1] as *const TestNode;
        let unlinked = unsafe { list.retain(|node| node as *const _ == odd) };
        assert_eq!(unlinked, 3);
        assert_eq!(linked(&list), [&nodes[4] as *const _, odd]);
    }

    #[test]
    fn concurrent_first_registrations_are_all_reachable() {
        const THREADS: usize = 16;
        let list = Arc::new(PublicationList::<u32, ()>::new());
        let nodes: Arc<Vec<TestNode>> = Arc::new((0..THREADS).map(|_| TestNode::new()).collect());
        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let list = Arc::clone(&list);
                let nodes = Arc::clone(&nodes);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    list.ensure_registered(&nodes[i]);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let mut found = linked(&list);
        found.sort_unstable();
        let mut expected: Vec<_> = nodes.iter().map(|n| n as *const _).collect();
        expected.sort_unstable();
        assert_eq!(found, expected);
    }
}

#[cfg(all(loom, test))]
mod model {
    use crate::loom::models;

    #[test]
    fn concurrent_registration() {
        models::concurrent_registration();
    }
}
