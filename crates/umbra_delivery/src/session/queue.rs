//! Load queue: cells a session wants, nearest first.

use std::collections::VecDeque;

use umbra_core::CellCoord;

/// Cells waiting for a generation slot, ordered by ascending priority.
///
/// Entries with equal priority keep their insertion order.
#[derive(Clone, Debug, Default)]
pub struct LoadQueue {
    entries: VecDeque<(CellCoord, u32)>,
}

impl LoadQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `cell` behind every entry with the same or lower priority.
    /// Returns false if the cell is already queued.
    pub fn insert_sorted(&mut self, cell: CellCoord, priority: u32) -> bool {
        if self.contains(cell) {
            return false;
        }
        let at = self.entries.partition_point(|(_, p)| *p <= priority);
        self.entries.insert(at, (cell, priority));
        true
    }

    /// Puts `cell` at the head of the queue, moving it if already queued.
    pub fn push_front(&mut self, cell: CellCoord) {
        self.remove(cell);
        let priority = self.entries.front().map_or(0, |(_, p)| *p);
        self.entries.push_front((cell, priority));
    }

    /// Takes the next cell.
    pub fn pop_front(&mut self) -> Option<(CellCoord, u32)> {
        self.entries.pop_front()
    }

    /// Removes `cell`. Returns true if it was queued.
    pub fn remove(&mut self, cell: CellCoord) -> bool {
        match self.entries.iter().position(|(c, _)| *c == cell) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Returns true if `cell` is queued.
    #[must_use]
    pub fn contains(&self, cell: CellCoord) -> bool {
        self.entries.iter().any(|(c, _)| *c == cell)
    }

    /// Queued cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(queue: &mut LoadQueue) -> Vec<(i32, i32)> {
        std::iter::from_fn(|| queue.pop_front())
            .map(|(c, _)| (c.x, c.z))
            .collect()
    }

    #[test]
    fn test_priority_order_is_stable() {
        let mut queue = LoadQueue::new();
        queue.insert_sorted(CellCoord::new(5, 0), 5);
        queue.insert_sorted(CellCoord::new(1, 0), 1);
        queue.insert_sorted(CellCoord::new(1, 1), 1);
        queue.insert_sorted(CellCoord::new(0, 0), 0);

        assert_eq!(order(&mut queue), vec![(0, 0), (1, 0), (1, 1), (5, 0)]);
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut queue = LoadQueue::new();
        assert!(queue.insert_sorted(CellCoord::new(2, 2), 3));
        assert!(!queue.insert_sorted(CellCoord::new(2, 2), 0));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_push_front_moves_entry() {
        let mut queue = LoadQueue::new();
        queue.insert_sorted(CellCoord::new(0, 0), 0);
        queue.insert_sorted(CellCoord::new(9, 9), 9);

        queue.push_front(CellCoord::new(9, 9));
        assert_eq!(order(&mut queue), vec![(9, 9), (0, 0)]);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut queue = LoadQueue::new();
        queue.insert_sorted(CellCoord::new(0, 0), 0);
        queue.insert_sorted(CellCoord::new(0, 1), 1);

        assert!(queue.remove(CellCoord::new(0, 0)));
        assert!(!queue.remove(CellCoord::new(0, 0)));
        assert!(!queue.contains(CellCoord::new(0, 0)));
        queue.clear();
        assert!(queue.is_empty());
    }
}
