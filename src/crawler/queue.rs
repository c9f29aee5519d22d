//! Binary-heap priority queue ordered by a caller-supplied relation
//!
//! `std::collections::BinaryHeap` needs a total `Ord` on the item type; the crawl
//! frontier instead orders targets by a "is higher priority" relation that lives
//! with the caller, so the heap is kept here over a plain `Vec`.

/// Relation returning true when the first item should be popped before the second
pub type HigherFn<T> = fn(&T, &T) -> bool;

/// A binary max-heap over `T` with O(log n) push and pop
pub struct PriorityQueue<T> {
    items: Vec<T>,
    higher: HigherFn<T>,
}

impl<T> PriorityQueue<T> {
    /// Creates an empty queue ordered by `higher`
    pub fn new(higher: HigherFn<T>) -> Self {
        Self {
            items: Vec::new(),
            higher,
        }
    }

    /// Adds an item
    pub fn push(&mut self, item: T) {
        self.items.push(item);
        self.sift_up(self.items.len() - 1);
    }

    /// Removes and returns the highest-priority item, or `None` if the queue is empty
    pub fn pop(&mut self) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }

        let item = self.items.swap_remove(0);
        if !self.items.is_empty() {
            self.sift_down(0);
        }
        Some(item)
    }

    /// Returns the highest-priority item without removing it
    pub fn top(&self) -> Option<&T> {
        self.items.first()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Removes every item
    pub fn clear(&mut self) {
        self.items.clear();
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !(self.higher)(&self.items[index], &self.items[parent]) {
                break;
            }
            self.items.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.items.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut best = index;

            if left < len && (self.higher)(&self.items[left], &self.items[best]) {
                best = left;
            }
            if right < len && (self.higher)(&self.items[right], &self.items[best]) {
                best = right;
            }
            if best == index {
                break;
            }
            self.items.swap(index, best);
            index = best;
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for PriorityQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("len", &self.items.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// (priority, sequence); higher priority first, then lower sequence
    fn higher(a: &(u32, u32), b: &(u32, u32)) -> bool {
        a.0 > b.0 || (a.0 == b.0 && a.1 < b.1)
    }

    /// Small deterministic generator so the test needs no extra crates
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u32 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (self.0 >> 33) as u32
        }
    }

    #[test]
    fn test_empty_queue() {
        let mut queue: PriorityQueue<(u32, u32)> = PriorityQueue::new(higher);
        assert!(queue.is_empty());
        assert!(queue.top().is_none());
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_pops_in_priority_order() {
        let mut queue = PriorityQueue::new(higher);
        queue.push((1, 0));
        queue.push((5, 1));
        queue.push((3, 2));

        assert_eq!(queue.top(), Some(&(5, 1)));
        assert_eq!(queue.pop(), Some((5, 1)));
        assert_eq!(queue.pop(), Some((3, 2)));
        assert_eq!(queue.pop(), Some((1, 0)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_ties_pop_oldest_first() {
        let mut queue = PriorityQueue::new(higher);
        for seq in 0..10 {
            queue.push((7, seq));
        }
        for seq in 0..10 {
            assert_eq!(queue.pop(), Some((7, seq)));
        }
    }

    #[test]
    fn test_interleaved_operations_always_pop_maximum() {
        let mut rng = Lcg(42);
        let mut queue = PriorityQueue::new(higher);
        let mut mirror: Vec<(u32, u32)> = Vec::new();
        let mut seq = 0;

        for _ in 0..2000 {
            if rng.next() % 3 != 0 || mirror.is_empty() {
                let item = (rng.next() % 8, seq);
                seq += 1;
                queue.push(item);
                mirror.push(item);
            } else {
                let expected = *mirror
                    .iter()
                    .fold(None, |best: Option<&(u32, u32)>, item| match best {
                        Some(b) if !higher(item, b) => Some(b),
                        _ => Some(item),
                    })
                    .unwrap();
                mirror.retain(|item| *item != expected);
                assert_eq!(queue.pop(), Some(expected));
            }
            assert_eq!(queue.len(), mirror.len());
        }

        while let Some(item) = queue.pop() {
            mirror.retain(|m| *m != item);
        }
        assert!(mirror.is_empty());
        assert!(queue.is_empty());
    }
}
