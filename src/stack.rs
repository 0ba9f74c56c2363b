//! A lock-free Treiber stack.
//!
//! RCL servers keep their parked serving threads on one of these so the
//! management thread can wake the most recently parked one. Popped nodes are
//! reclaimed through [`crossbeam_epoch`], so a concurrent `pop` never reads a
//! freed node.

use core::fmt;
use core::mem::ManuallyDrop;
use core::ptr;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crossbeam_epoch::{self as epoch, Atomic, Owned};

struct Node<T> {
    data: ManuallyDrop<T>,
    next: Atomic<Node<T>>,
}

/// A lock-free LIFO stack.
///
/// # Examples
///
/// ```
/// use dlock::stack::Stack;
///
/// let stack = Stack::new();
/// stack.push(1);
/// stack.push(2);
/// assert_eq!(stack.pop(), Some(2));
/// assert_eq!(stack.pop(), Some(1));
/// assert!(stack.is_empty());
/// ```
pub struct Stack<T> {
    head: Atomic<Node<T>>,
}

impl<T> Stack<T> {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self { head: Atomic::null() }
    }

    /// Pushes `value` on top of the stack.
    pub fn push(&self, value: T) {
        let mut node = Owned::new(Node { data: ManuallyDrop::new(value), next: Atomic::null() });
        let guard = epoch::pin();
        loop {
            let head = self.head.load(Relaxed, &guard);
            node.next.store(head, Relaxed);
            match self.head.compare_exchange(head, node, Release, Relaxed, &guard) {
                Ok(_) => return,
                Err(err) => node = err.new,
            }
        }
    }

    /// Removes the top of the stack, or returns `None` if it is empty.
    pub fn pop(&self) -> Option<T> {
        let guard = epoch::pin();
        loop {
            let head = self.head.load(Acquire, &guard);
            // SAFETY: The guard keeps every node reachable since it was pinned
            // alive.
            let node = unsafe { head.as_ref() }?;
            let next = node.next.load(Relaxed, &guard);
            if self.head.compare_exchange(head, next, Relaxed, Relaxed, &guard).is_ok() {
                // SAFETY: Winning the exchange unlinked the node, so only this
                // thread takes its data, and it is freed once no pinned thread
                // can still be reading it.
                unsafe {
                    guard.defer_destroy(head);
                    return Some(ManuallyDrop::into_inner(ptr::read(&node.data)));
                }
            }
        }
    }

    /// Returns `true` if the stack holds no elements.
    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        self.head.load(Acquire, &guard).is_null()
    }
}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Stack<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

impl<T> fmt::Debug for Stack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack").field("empty", &self.is_empty()).finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::Stack;

    #[test]
    fn last_in_first_out() {
        let stack = Stack::new();
        assert!(stack.is_empty());
        assert_eq!(stack.pop(), None::<u32>);
        for i in 0..10 {
            stack.push(i);
        }
        assert!(!stack.is_empty());
        let popped: Vec<_> = core::iter::from_fn(|| stack.pop()).collect();
        assert_eq!(popped, (0..10).rev().collect::<Vec<_>>());
        assert!(stack.is_empty());
    }

    #[test]
    fn every_element_popped_exactly_once() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 5_000;
        const TOTAL: usize = PRODUCERS * PER_PRODUCER;

        let stack = Arc::new(Stack::new());
        let popped = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(PRODUCERS + CONSUMERS));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let stack = Arc::clone(&stack);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..PER_PRODUCER {
                        stack.push(p * PER_PRODUCER + i);
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let stack = Arc::clone(&stack);
                let popped = Arc::clone(&popped);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut mine = Vec::new();
                    while popped.load(Ordering::SeqCst) < TOTAL {
                        if let Some(value) = stack.pop() {
                            popped.fetch_add(1, Ordering::SeqCst);
                            mine.push(value);
                        } else {
                            thread::yield_now();
                        }
                    }
                    mine
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }
        let mut seen: Vec<usize> =
            consumers.into_iter().flat_map(|c| c.join().unwrap()).collect();
        seen.sort_unstable();
        assert!(seen.into_iter().eq(0..TOTAL));
        assert!(stack.is_empty());
    }

    #[test]
    fn drop_releases_remaining_elements() {
        struct Counted(Arc<AtomicUsize>);

        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let stack = Stack::new();
        for _ in 0..3 {
            stack.push(Counted(Arc::clone(&drops)));
        }
        drop(stack.pop());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        drop(stack);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }
}
