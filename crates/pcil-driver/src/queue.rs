//! FIFO queue used for every free list and work queue in a device block.
//!
//! Entries are arena indices (or small owned values), never pointers. The
//! queue does no locking of its own; callers hold the device block lock.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct Fifo<T> {
    items: VecDeque<T>,
}

impl<T> Fifo<T> {
    /// Creates a queue that will not reallocate until it holds more than
    /// `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
        }
    }

    pub fn enqueue(&mut self, item: T) {
        self.items.push_back(item);
    }

    pub fn dequeue(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl<T> Default for Fifo<T> {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl<T> FromIterator<T> for Fifo<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dequeues_in_insertion_order() {
        let mut q = Fifo::with_capacity(4);
        assert_eq!(q.dequeue(), None::<u16>);
        q.enqueue(3);
        q.enqueue(1);
        q.enqueue(2);
        assert_eq!(q.len(), 3);
        assert_eq!(q.dequeue(), Some(3));
        q.enqueue(7);
        assert_eq!(q.iter().copied().collect::<Vec<_>>(), vec![1, 2, 7]);
    }

    #[test]
    fn empty_after_draining() {
        let mut q: Fifo<u16> = (0..5).collect();
        while q.dequeue().is_some() {}
        assert!(q.is_empty());
        q.enqueue(9);
        assert_eq!(q.dequeue(), Some(9));
    }
}
