//! Min-max heap: a double-ended priority queue.
//!
//! Levels alternate between min and max, starting with a min level at the
//! root. Every element on a min level is `<=` all of its descendants; every
//! element on a max level is `>=` all of its descendants. The minimum is the
//! root and the maximum is one of the root's children, so both ends are
//! O(1) to read and O(log n) to pop.
//!
//! The transaction pool uses it to hand the highest-paying transaction to
//! the miner while evicting the lowest-paying one when full.

#[derive(Debug, Clone)]
pub struct MinMaxHeap<T> {
    data: Vec<T>,
}

impl<T> Default for MinMaxHeap<T> {
    fn default() -> Self {
        Self { data: Vec::new() }
    }
}

fn is_min_level(i: usize) -> bool {
    (i + 1).ilog2() % 2 == 0
}

fn parent(i: usize) -> usize {
    (i - 1) / 2
}

impl<T: Ord> MinMaxHeap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Iterate in heap order (not sorted).
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.data.iter()
    }

    pub fn insert(&mut self, item: T) {
        self.data.push(item);
        self.bubble_up(self.data.len() - 1);
    }

    pub fn min(&self) -> Option<&T> {
        self.data.first()
    }

    pub fn max(&self) -> Option<&T> {
        self.max_index().map(|i| &self.data[i])
    }

    pub fn pop_min(&mut self) -> Option<T> {
        if self.data.is_empty() {
            return None;
        }
        let item = self.data.swap_remove(0);
        if !self.data.is_empty() {
            self.trickle_down(0);
        }
        Some(item)
    }

    pub fn pop_max(&mut self) -> Option<T> {
        let idx = self.max_index()?;
        let item = self.data.swap_remove(idx);
        if idx < self.data.len() {
            self.trickle_down(idx);
        }
        Some(item)
    }

    /// Keep only the elements matching `keep`, then rebuild.
    pub fn retain(&mut self, keep: impl FnMut(&T) -> bool) {
        self.data.retain(keep);
        for i in (0..self.data.len()).rev() {
            self.trickle_down(i);
        }
    }

    fn max_index(&self) -> Option<usize> {
        match self.data.len() {
            0 => None,
            1 => Some(0),
            2 => Some(1),
            _ => Some(if self.data[1] >= self.data[2] { 1 } else { 2 }),
        }
    }

    // -- BubbleUp ----------------------------------------------------------

    fn bubble_up(&mut self, i: usize) {
        if i == 0 {
            return;
        }
        let p = parent(i);
        if is_min_level(i) {
            if self.data[i] > self.data[p] {
                self.data.swap(i, p);
                self.bubble_up_grandparents(p, |a, b| a > b);
            } else {
                self.bubble_up_grandparents(i, |a, b| a < b);
            }
        } else if self.data[i] < self.data[p] {
            self.data.swap(i, p);
            self.bubble_up_grandparents(p, |a, b| a < b);
        } else {
            self.bubble_up_grandparents(i, |a, b| a > b);
        }
    }

    /// Move `i` up through its grandparents while `better(i, grandparent)`.
    fn bubble_up_grandparents(&mut self, mut i: usize, better: impl Fn(&T, &T) -> bool) {
        while i >= 3 {
            let gp = parent(parent(i));
            if better(&self.data[i], &self.data[gp]) {
                self.data.swap(i, gp);
                i = gp;
            } else {
                break;
            }
        }
    }

    // -- TrickleDown -------------------------------------------------------

    fn trickle_down(&mut self, i: usize) {
        if is_min_level(i) {
            self.trickle_down_with(i, |a, b| a < b);
        } else {
            self.trickle_down_with(i, |a, b| a > b);
        }
    }

    /// `better` is `<` on min levels and `>` on max levels.
    fn trickle_down_with(&mut self, mut i: usize, better: impl Fn(&T, &T) -> bool) {
        loop {
            let Some(m) = self.best_descendant(i, &better) else {
                return;
            };
            let is_grandchild = m > 2 * i + 2;
            if !better(&self.data[m], &self.data[i]) {
                return;
            }
            self.data.swap(m, i);
            if !is_grandchild {
                return;
            }
            let p = parent(m);
            if better(&self.data[p], &self.data[m]) {
                self.data.swap(m, p);
            }
            i = m;
        }
    }

    /// Best among the children and grandchildren of `i`.
    fn best_descendant(&self, i: usize, better: &impl Fn(&T, &T) -> bool) -> Option<usize> {
        let len = self.data.len();
        let first_child = 2 * i + 1;
        if first_child >= len {
            return None;
        }
        let candidates = [
            first_child,
            first_child + 1,
            4 * i + 3,
            4 * i + 4,
            4 * i + 5,
            4 * i + 6,
        ];
        let mut best = first_child;
        for &c in candidates.iter().skip(1) {
            if c < len && better(&self.data[c], &self.data[best]) {
                best = c;
            }
        }
        Some(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invariants(heap: &MinMaxHeap<i32>) {
        let d = &heap.data;
        for i in 0..d.len() {
            let mut stack = vec![2 * i + 1, 2 * i + 2];
            while let Some(j) = stack.pop() {
                if j >= d.len() {
                    continue;
                }
                if is_min_level(i) {
                    assert!(d[i] <= d[j], "min level {} > descendant {}", d[i], d[j]);
                } else {
                    assert!(d[i] >= d[j], "max level {} < descendant {}", d[i], d[j]);
                }
                stack.push(2 * j + 1);
                stack.push(2 * j + 2);
            }
        }
    }

    #[test]
    fn mixed_pops_follow_both_ends() {
        let mut heap = MinMaxHeap::new();
        for v in [31, 46, 51, 10, 30, 21, 71, 41, 11, 13, 16, 8] {
            heap.insert(v);
            assert_invariants(&heap);
        }
        assert_eq!(heap.pop_max(), Some(71));
        assert_eq!(heap.pop_min(), Some(8));
        assert_eq!(heap.pop_min(), Some(10));
        assert_eq!(heap.pop_max(), Some(51));
        assert_eq!(heap.pop_min(), Some(11));
        assert_invariants(&heap);
        assert_eq!(heap.len(), 7);
    }

    #[test]
    fn empty_and_singleton() {
        let mut heap: MinMaxHeap<i32> = MinMaxHeap::new();
        assert!(heap.min().is_none());
        assert!(heap.pop_max().is_none());
        heap.insert(5);
        assert_eq!(heap.min(), Some(&5));
        assert_eq!(heap.max(), Some(&5));
        assert_eq!(heap.pop_max(), Some(5));
        assert!(heap.is_empty());
    }

    #[test]
    fn pop_min_is_sorted_and_pop_max_is_reverse_sorted() {
        let values: Vec<i32> = (0..200).map(|i| (i * 7919) % 211 - 100).collect();

        let mut heap = MinMaxHeap::new();
        values.iter().for_each(|v| heap.insert(*v));
        let mut ascending = Vec::new();
        while let Some(v) = heap.pop_min() {
            ascending.push(v);
        }
        let mut expected = values.clone();
        expected.sort();
        assert_eq!(ascending, expected);

        let mut heap = MinMaxHeap::new();
        values.iter().for_each(|v| heap.insert(*v));
        let mut descending = Vec::new();
        while let Some(v) = heap.pop_max() {
            descending.push(v);
        }
        expected.reverse();
        assert_eq!(descending, expected);
    }

    #[test]
    fn interleaved_operations_keep_min_below_max() {
        let mut heap = MinMaxHeap::new();
        let mut x: i64 = 17;
        for step in 0..1_000 {
            x = (x * 1_103_515_245 + 12_345) % 2_147_483_648;
            match step % 5 {
                0 | 1 | 2 => heap.insert((x % 1000) as i32),
                3 => {
                    heap.pop_min();
                }
                _ => {
                    heap.pop_max();
                }
            }
            if let (Some(lo), Some(hi)) = (heap.min(), heap.max()) {
                assert!(lo <= hi);
            }
        }
        assert_invariants(&heap);
    }

    #[test]
    fn retain_rebuilds_the_heap() {
        let mut heap = MinMaxHeap::new();
        for v in 0..50 {
            heap.insert(v);
        }
        heap.retain(|v| v % 3 == 0);
        assert_invariants(&heap);
        assert_eq!(heap.min(), Some(&0));
        assert_eq!(heap.max(), Some(&48));
        assert_eq!(heap.len(), 17);
    }
}
