// Pending spawn requests, one FIFO per priority tier

use std::collections::VecDeque;

use crate::priority::Priority;

#[derive(Debug)]
pub struct PendingQueue<T> {
    high: VecDeque<T>,
    medium: VecDeque<T>,
    low: VecDeque<T>,
}

impl<T> Default for PendingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingQueue<T> {
    pub fn new() -> Self {
        Self {
            high: VecDeque::new(),
            medium: VecDeque::new(),
            low: VecDeque::new(),
        }
    }

    fn tier(&self, priority: Priority) -> &VecDeque<T> {
        match priority {
            Priority::High => &self.high,
            Priority::Medium => &self.medium,
            Priority::Low => &self.low,
        }
    }

    fn tier_mut(&mut self, priority: Priority) -> &mut VecDeque<T> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Medium => &mut self.medium,
            Priority::Low => &mut self.low,
        }
    }

    /// Enqueue and return the 1-based admission position at this moment
    pub fn push(&mut self, priority: Priority, entry: T) -> usize {
        self.tier_mut(priority).push_back(entry);
        Priority::DESCENDING
            .iter()
            .filter(|tier| **tier >= priority)
            .map(|tier| self.tier(*tier).len())
            .sum()
    }

    /// Next entry to admit: highest tier first, oldest first within it
    pub fn pop(&mut self) -> Option<(Priority, T)> {
        Priority::DESCENDING.into_iter().find_map(|priority| {
            self.tier_mut(priority)
                .pop_front()
                .map(|entry| (priority, entry))
        })
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.medium.len() + self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries in admission order with their priority
    pub fn iter(&self) -> impl Iterator<Item = (Priority, &T)> {
        Priority::DESCENDING
            .into_iter()
            .flat_map(move |priority| self.tier(priority).iter().map(move |entry| (priority, entry)))
    }

    /// Remove everything, in admission order
    pub fn drain(&mut self) -> Vec<(Priority, T)> {
        let mut drained = Vec::with_capacity(self.len());
        while let Some(entry) = self.pop() {
            drained.push(entry);
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positions_count_everything_admitted_earlier() {
        let mut queue = PendingQueue::new();
        assert_eq!(queue.push(Priority::Low, "l1"), 1);
        assert_eq!(queue.push(Priority::Medium, "m1"), 1);
        assert_eq!(queue.push(Priority::High, "h1"), 1);
        assert_eq!(queue.push(Priority::Medium, "m2"), 3);
        assert_eq!(queue.push(Priority::Low, "l2"), 5);
    }

    #[test]
    fn test_pop_is_priority_then_fifo() {
        let mut queue = PendingQueue::new();
        queue.push(Priority::Low, 1);
        queue.push(Priority::High, 2);
        queue.push(Priority::Medium, 3);
        queue.push(Priority::High, 4);

        let order: Vec<_> = queue.iter().map(|(_, entry)| *entry).collect();
        assert_eq!(order, vec![2, 4, 3, 1]);

        assert_eq!(queue.pop(), Some((Priority::High, 2)));
        assert_eq!(queue.pop(), Some((Priority::High, 4)));
        assert_eq!(queue.drain(), vec![(Priority::Medium, 3), (Priority::Low, 1)]);
        assert!(queue.is_empty());
    }
}
