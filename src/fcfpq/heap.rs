//! A binary heap whose entries know their own position.
//!
//! Entries are told their index every time they move, so the owner can tell
//! at a glance whether something is queued, and a known index can be
//! re-keyed in logarithmic time with [`Heap::change_key`].

use core::marker::PhantomData;

use crate::error::Error;

/// Capacity reserved by the first push.
const INITIAL_CAPACITY: usize = 16;

/// An entry of a [`Heap`].
pub(crate) trait Keyed {
    /// The priority the entry is ordered by.
    fn key(&self) -> u64;

    /// Overwrites the priority. The heap restores its order afterwards.
    fn set_key(&mut self, key: u64);

    /// Records the entry's index, or `None` once it left the heap.
    fn set_pos(&mut self, pos: Option<usize>);
}

/// The direction a [`Heap`] is ordered in.
pub(crate) trait Order {
    /// Returns `true` if `a` should be popped before `b`.
    fn precedes(a: u64, b: u64) -> bool;
}

/// Smallest key first.
#[derive(Debug)]
pub(crate) enum MinFirst {}

impl Order for MinFirst {
    fn precedes(a: u64, b: u64) -> bool {
        a < b
    }
}

/// Largest key first.
#[derive(Debug)]
#[cfg_attr(not(test), allow(dead_code))]
pub(crate) enum MaxFirst {}

impl Order for MaxFirst {
    fn precedes(a: u64, b: u64) -> bool {
        a > b
    }
}

#[derive(Debug)]
pub(crate) struct Heap<E, O = MinFirst> {
    items: Vec<E>,
    limit: usize,
    order: PhantomData<O>,
}

impl<E: Keyed, O: Order> Heap<E, O> {
    /// Creates an empty heap. No memory is reserved until the first push.
    pub(crate) fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Creates an empty heap that never grows past `limit` entries.
    pub(crate) fn with_limit(limit: usize) -> Self {
        Self { items: Vec::new(), limit, order: PhantomData }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[cfg(all(not(loom), test))]
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    #[cfg(all(not(loom), test))]
    pub(crate) fn capacity(&self) -> usize {
        self.items.capacity()
    }

    /// Inserts `item`, doubling the storage first if it is full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueGrowth`] if the storage could not grow. The item
    /// is dropped and the heap is left as it was.
    pub(crate) fn push(&mut self, mut item: E) -> Result<(), Error> {
        if self.items.len() == self.items.capacity() {
            self.grow()?;
        }
        let pos = self.items.len();
        item.set_pos(Some(pos));
        self.items.push(item);
        self.sift_up(pos);
        Ok(())
    }

    /// Removes and returns the first entry.
    pub(crate) fn pop(&mut self) -> Option<E> {
        let last = self.items.len().checked_sub(1)?;
        self.items.swap(0, last);
        let mut top = self.items.pop()?;
        top.set_pos(None);
        if let Some(first) = self.items.first_mut() {
            first.set_pos(Some(0));
            self.sift_down(0);
        }
        Some(top)
    }

    /// Replaces the key of the entry at `pos` and moves it to its new place.
    ///
    /// Returns `false` if no entry sits at `pos`.
    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn change_key(&mut self, pos: usize, key: u64) -> bool {
        let Some(item) = self.items.get_mut(pos) else {
            return false;
        };
        let old = item.key();
        item.set_key(key);
        if O::precedes(key, old) {
            self.sift_up(pos);
        } else {
            self.sift_down(pos);
        }
        true
    }

    /// Lowers every key by `amount`, saturating at zero.
    ///
    /// A uniform saturating decrement keeps every parent ordered before its
    /// children in either direction, so no entry moves.
    pub(crate) fn lower_all(&mut self, amount: u64) {
        for item in &mut self.items {
            let key = item.key().saturating_sub(amount);
            item.set_key(key);
        }
    }

    fn grow(&mut self) -> Result<(), Error> {
        let capacity = self.items.capacity();
        let target = if capacity == 0 { INITIAL_CAPACITY } else { capacity.saturating_mul(2) };
        if target > self.limit || self.items.try_reserve_exact(target - self.items.len()).is_err() {
            return Err(Error::QueueGrowth { capacity });
        }
        log::debug!("combiner queue grew from {capacity} to {} entries", self.items.capacity());
        Ok(())
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.items.swap(a, b);
        self.items[a].set_pos(Some(a));
        self.items[b].set_pos(Some(b));
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !O::precedes(self.items[pos].key(), self.items[parent].key()) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.items.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut first = pos;
            if left < len && O::precedes(self.items[left].key(), self.items[first].key()) {
                first = left;
            }
            if right < len && O::precedes(self.items[right].key(), self.items[first].key()) {
                first = right;
            }
            if first == pos {
                break;
            }
            self.swap(pos, first);
            pos = first;
        }
    }

    /// Checks that every parent is ordered before its children and that every
    /// entry is at the position it was last told.
    #[cfg(all(not(loom), test))]
    fn assert_valid(&self, pos_of: impl Fn(&E) -> Option<usize>) {
        for (i, item) in self.items.iter().enumerate() {
            assert_eq!(pos_of(item), Some(i), "entry {i} lost track of its position");
            if i > 0 {
                let parent = (i - 1) / 2;
                assert!(
                    !O::precedes(item.key(), self.items[parent].key()),
                    "entry {i} precedes its parent {parent}"
                );
            }
        }
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use core::cell::Cell;

    use super::{Heap, Keyed, MaxFirst, MinFirst, Order};
    use crate::Error;

    struct Entry<'a> {
        key: u64,
        id: usize,
        positions: &'a [Cell<Option<usize>>],
    }

    impl Keyed for Entry<'_> {
        fn key(&self) -> u64 {
            self.key
        }

        fn set_key(&mut self, key: u64) {
            self.key = key;
        }

        fn set_pos(&mut self, pos: Option<usize>) {
            self.positions[self.id].set(pos);
        }
    }

    /// Deterministic pseudo random keys.
    fn keys(count: usize) -> Vec<u64> {
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        (0..count)
            .map(|_| {
                state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
                state >> 40
            })
            .collect()
    }

    fn drain_in_order<O: Order>(mut expected: Vec<u64>) {
        let positions: Vec<_> = (0..expected.len()).map(|_| Cell::new(None)).collect();
        let mut heap = Heap::<Entry<'_>, O>::new();
        for (id, &key) in expected.iter().enumerate() {
            heap.push(Entry { key, id, positions: &positions }).unwrap();
            heap.assert_valid(|entry| positions[entry.id].get());
        }
        expected.sort_unstable_by(|a, b| {
            if O::precedes(*a, *b) {
                core::cmp::Ordering::Less
            } else if O::precedes(*b, *a) {
                core::cmp::Ordering::Greater
            } else {
                core::cmp::Ordering::Equal
            }
        });
        for key in expected {
            let entry = heap.pop().unwrap();
            assert_eq!(entry.key, key);
            assert_eq!(positions[entry.id].get(), None);
            heap.assert_valid(|entry| positions[entry.id].get());
        }
        assert!(heap.pop().is_none());
    }

    #[test]
    fn min_first_pops_ascending() {
        drain_in_order::<MinFirst>(keys(200));
    }

    #[test]
    fn max_first_pops_descending() {
        drain_in_order::<MaxFirst>(keys(200));
    }

    #[test]
    fn equal_keys() {
        drain_in_order::<MinFirst>(vec![5; 40]);
    }

    #[test]
    fn interleaved_push_and_pop() {
        let input = keys(64);
        let positions: Vec<_> = (0..input.len()).map(|_| Cell::new(None)).collect();
        let mut heap = Heap::<Entry<'_>>::new();
        for (id, &key) in input.iter().enumerate() {
            heap.push(Entry { key, id, positions: &positions }).unwrap();
            if id % 3 == 2 {
                let entry = heap.pop().unwrap();
                assert!(heap.items.iter().all(|rest| rest.key >= entry.key));
            }
            heap.assert_valid(|entry| positions[entry.id].get());
        }
        let queued = positions.iter().filter(|pos| pos.get().is_some()).count();
        assert_eq!(queued, heap.len());
    }

    #[test]
    fn capacity_starts_at_sixteen_and_doubles() {
        let positions: Vec<_> = (0..40).map(|_| Cell::new(None)).collect();
        let mut heap = Heap::<Entry<'_>>::new();
        assert_eq!(heap.capacity(), 0);
        heap.push(Entry { key: 0, id: 0, positions: &positions }).unwrap();
        assert_eq!(heap.capacity(), 16);
        for id in 1..17 {
            heap.push(Entry { key: id as u64, id, positions: &positions }).unwrap();
        }
        assert_eq!(heap.capacity(), 32);
        heap.assert_valid(|entry| positions[entry.id].get());
    }

    #[test]
    fn growth_past_limit_is_refused() {
        let positions: Vec<_> = (0..17).map(|_| Cell::new(None)).collect();
        let mut heap = Heap::<Entry<'_>>::with_limit(16);
        for id in 0..16 {
            heap.push(Entry { key: 16 - id as u64, id, positions: &positions }).unwrap();
        }
        let err = heap.push(Entry { key: 0, id: 16, positions: &positions }).unwrap_err();
        assert!(matches!(err, Error::QueueGrowth { capacity: 16 }));
        // The refused entry never entered the heap.
        assert_eq!(positions[16].get(), None);
        assert_eq!(heap.len(), 16);
        assert_eq!(heap.pop().unwrap().key, 1);
    }

    #[test]
    fn lower_all_keeps_order() {
        let input = keys(50);
        let positions: Vec<_> = (0..input.len()).map(|_| Cell::new(None)).collect();
        let mut heap = Heap::<Entry<'_>, MaxFirst>::new();
        for (id, &key) in input.iter().enumerate() {
            heap.push(Entry { key, id, positions: &positions }).unwrap();
        }
        let median = {
            let mut sorted = input.clone();
            sorted.sort_unstable();
            sorted[sorted.len() / 2]
        };
        heap.lower_all(median);
        heap.assert_valid(|entry| positions[entry.id].get());
        let max = input.iter().copied().max().unwrap();
        assert_eq!(heap.pop().unwrap().key, max - median);
    }

    #[test]
    fn change_key_moves_entry_both_ways() {
        let input = keys(40);
        let positions: Vec<_> = (0..input.len()).map(|_| Cell::new(None)).collect();
        let mut heap = Heap::<Entry<'_>>::new();
        for (id, &key) in input.iter().enumerate() {
            heap.push(Entry { key: key + 1, id, positions: &positions }).unwrap();
        }
        // The heaviest entry becomes the lightest and climbs to the top.
        let (heaviest, _) = input.iter().enumerate().max_by_key(|&(_, key)| *key).unwrap();
        let pos = positions[heaviest].get().unwrap();
        assert!(heap.change_key(pos, 0));
        heap.assert_valid(|entry| positions[entry.id].get());
        assert_eq!(positions[heaviest].get(), Some(0));

        // The top entry becomes the heaviest and sinks to a leaf.
        assert!(heap.change_key(0, u64::MAX));
        heap.assert_valid(|entry| positions[entry.id].get());
        assert!(2 * positions[heaviest].get().unwrap() + 1 >= heap.len());

        assert!(!heap.change_key(heap.len(), 1));
        let drained: Vec<_> = core::iter::from_fn(|| heap.pop()).map(|entry| entry.key).collect();
        assert!(drained.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(drained.last(), Some(&u64::MAX));
    }
}
