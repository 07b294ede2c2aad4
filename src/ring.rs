//! Fixed-capacity FIFO ring buffer.
//!
//! Slots are allocated once, rounded up to a power of two so that index
//! wrap is a bitwise AND. The rounding is an addressing detail only:
//! admission is always checked against the caller-requested `max_size`.
//!
//! A full buffer rejects new items. Dropping the oldest entry to make room
//! is a separate, explicit operation ([`RingBuffer::evict_oldest`] or
//! [`RingBuffer::push_evicting`]).

use smallvec::SmallVec;

/// A bounded FIFO queue with O(1) push and pop.
pub struct RingBuffer<T> {
    slots: Box<[Option<T>]>,
    max_size: usize,
    mask: usize,
    head: usize,
    tail: usize,
    count: usize,
}

impl<T> RingBuffer<T> {
    /// Creates an empty buffer admitting at most `max_size` items.
    ///
    /// # Panics
    ///
    /// Panics if `max_size` is 0.
    pub fn new(max_size: usize) -> Self {
        assert!(max_size > 0, "RingBuffer max_size must be > 0");
        let capacity = max_size.next_power_of_two();
        let slots = std::iter::repeat_with(|| None).take(capacity).collect();
        Self {
            slots,
            max_size,
            mask: capacity - 1,
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    /// The caller-requested bound.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of allocated slots. Always a power of two `>= max_size`.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns true if no items are queued.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns true if another push would be rejected.
    pub fn is_full(&self) -> bool {
        self.count >= self.max_size
    }

    /// Appends `item`, handing it back if the buffer is full.
    pub fn try_push(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.slots[self.tail & self.mask] = Some(item);
        self.tail = self.tail.wrapping_add(1);
        self.count += 1;
        Ok(())
    }

    /// Appends `item`. Returns false and drops `item` if the buffer is full;
    /// the queued contents are left untouched.
    pub fn push(&mut self, item: T) -> bool {
        self.try_push(item).is_ok()
    }

    /// Removes and returns the oldest item.
    pub fn pop(&mut self) -> Option<T> {
        if self.count == 0 {
            return None;
        }
        let item = self.slots[self.head & self.mask].take();
        self.head = self.head.wrapping_add(1);
        self.count -= 1;
        item
    }

    /// Returns the oldest item without removing it.
    pub fn peek(&self) -> Option<&T> {
        if self.count == 0 {
            return None;
        }
        self.slots[self.head & self.mask].as_ref()
    }

    /// Removes the oldest item to make room. Same as [`pop`](Self::pop),
    /// named for call sites that drop data deliberately.
    pub fn evict_oldest(&mut self) -> Option<T> {
        self.pop()
    }

    /// Appends `item`, evicting and returning the oldest item if full.
    pub fn push_evicting(&mut self, item: T) -> Option<T> {
        let evicted = if self.is_full() {
            self.evict_oldest()
        } else {
            None
        };
        // Cannot fail: a slot was freed above if the buffer was full.
        let _ = self.try_push(item);
        evicted
    }

    /// Drops every queued item.
    ///
    /// Only the occupied slots are visited, so the cost follows `len()`
    /// rather than `capacity()`.
    pub fn clear(&mut self) {
        for offset in 0..self.count {
            self.slots[self.head.wrapping_add(offset) & self.mask] = None;
        }
        self.head = 0;
        self.tail = 0;
        self.count = 0;
    }

    /// Keeps only the items for which `keep` returns true, preserving order.
    /// Returns the removed items, oldest first.
    pub fn retain<F>(&mut self, mut keep: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut removed = Vec::new();
        for _ in 0..self.count {
            if let Some(item) = self.pop() {
                if keep(&item) {
                    // A slot was just freed by the pop.
                    let _ = self.try_push(item);
                } else {
                    removed.push(item);
                }
            }
        }
        removed
    }

    /// Removes every item, oldest first.
    pub fn drain(&mut self) -> Drain<'_, T> {
        Drain { ring: self }
    }

    /// Iterates over queued items, oldest first, without consuming them.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            ring: self,
            offset: 0,
        }
    }

    /// Copies the current contents, oldest first.
    pub fn snapshot(&self) -> SmallVec<[T; 8]>
    where
        T: Clone,
    {
        self.iter().cloned().collect()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("max_size", &self.max_size)
            .field("capacity", &self.capacity())
            .field("items", &self.iter().collect::<Vec<_>>())
            .finish()
    }
}

/// Borrowing FIFO iterator returned by [`RingBuffer::iter`].
pub struct Iter<'a, T> {
    ring: &'a RingBuffer<T>,
    offset: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.ring.count {
            return None;
        }
        let index = self.ring.head.wrapping_add(self.offset) & self.ring.mask;
        self.offset += 1;
        self.ring.slots[index].as_ref()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.ring.count - self.offset;
        (remaining, Some(remaining))
    }
}

impl<T> ExactSizeIterator for Iter<'_, T> {}

impl<'a, T> IntoIterator for &'a RingBuffer<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Draining iterator returned by [`RingBuffer::drain`].
///
/// Items not consumed before the iterator is dropped are cleared.
pub struct Drain<'a, T> {
    ring: &'a mut RingBuffer<T>,
}

impl<T> Iterator for Drain<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.ring.pop()
    }
}

impl<T> Drop for Drain<'_, T> {
    fn drop(&mut self) {
        self.ring.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rounds_up_but_admission_uses_max_size() {
        let mut ring = RingBuffer::new(5);
        assert_eq!(ring.capacity(), 8);
        assert_eq!(ring.max_size(), 5);

        for i in 0..5 {
            assert!(ring.push(i));
        }
        assert!(ring.is_full());
        assert!(!ring.push(5));
        assert_eq!(ring.len(), 5);
    }

    #[test]
    fn rejects_when_full_then_accepts_after_pop() {
        let mut ring = RingBuffer::new(4);
        for item in ["a", "b", "c", "d"] {
            assert!(ring.push(item));
        }
        assert!(!ring.push("e"));
        assert_eq!(ring.pop(), Some("a"));
        assert!(ring.push("e"));

        let rest: Vec<_> = std::iter::from_fn(|| ring.pop()).collect();
        assert_eq!(rest, vec!["b", "c", "d", "e"]);
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn try_push_hands_back_rejected_item() {
        let mut ring = RingBuffer::new(1);
        assert_eq!(ring.try_push(String::from("x")), Ok(()));
        assert_eq!(ring.try_push(String::from("y")), Err(String::from("y")));
        assert_eq!(ring.peek().map(String::as_str), Some("x"));
    }

    #[test]
    fn peek_does_not_consume() {
        let mut ring = RingBuffer::new(2);
        assert_eq!(ring.peek(), None);
        ring.push(1);
        ring.push(2);
        assert_eq!(ring.peek(), Some(&1));
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.peek(), Some(&2));
    }

    #[test]
    fn pop_clears_slot() {
        use std::rc::Rc;

        let item = Rc::new(());
        let mut ring = RingBuffer::new(2);
        ring.push(Rc::clone(&item));
        assert_eq!(Rc::strong_count(&item), 2);
        drop(ring.pop());
        assert_eq!(Rc::strong_count(&item), 1);
    }

    #[test]
    fn clear_after_wraparound_releases_items() {
        use std::rc::Rc;

        let item = Rc::new(());
        let mut ring = RingBuffer::new(3);
        for _ in 0..3 {
            ring.push(Rc::clone(&item));
        }
        ring.pop();
        ring.pop();
        ring.push(Rc::clone(&item));
        ring.push(Rc::clone(&item));
        assert_eq!(Rc::strong_count(&item), 4);

        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(Rc::strong_count(&item), 1);

        ring.push(Rc::clone(&item));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn push_evicting_drops_oldest() {
        let mut ring = RingBuffer::new(2);
        assert_eq!(ring.push_evicting(1), None);
        assert_eq!(ring.push_evicting(2), None);
        assert_eq!(ring.push_evicting(3), Some(1));
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn retain_preserves_order() {
        let mut ring = RingBuffer::new(6);
        for i in 1..=6 {
            ring.push(i);
        }
        let removed = ring.retain(|n| n % 2 == 0);
        assert_eq!(removed, vec![1, 3, 5]);
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![2, 4, 6]);
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn iter_is_restartable() {
        let mut ring = RingBuffer::new(3);
        ring.push('x');
        ring.push('y');

        let first: String = ring.iter().collect();
        let second: String = (&ring).into_iter().collect();
        assert_eq!(first, "xy");
        assert_eq!(first, second);
        assert_eq!(ring.iter().len(), 2);
        assert_eq!(ring.snapshot().as_slice(), &['x', 'y']);
    }

    #[test]
    fn drain_empties_buffer_even_if_partially_consumed() {
        let mut ring = RingBuffer::new(4);
        for i in 0..4 {
            ring.push(i);
        }
        let first = ring.drain().next();
        assert_eq!(first, Some(0));
        assert!(ring.is_empty());
    }

    #[test]
    #[should_panic(expected = "max_size must be > 0")]
    fn zero_max_size_panics() {
        let _ = RingBuffer::<u8>::new(0);
    }
}
