//! Deferred re-execution of failed strategies
//!
//! A binary min-heap on due time with a side table of heap positions, so that
//! rescheduling and cancelling a strategy are O(log n) without scanning the heap.
//! A strategy id appears at most once.

use std::collections::HashMap;

use tokio::time::Instant;

use crate::grid::StrategyId;

/// One pending retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryItem {
    pub strategy_id: StrategyId,
    pub due_at: Instant,
}

#[derive(Debug, Default)]
pub struct RetryScheduler {
    heap: Vec<RetryItem>,
    /// Strategy id -> index into `heap`
    positions: HashMap<StrategyId, usize>,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `id` at `due_at`, replacing any earlier schedule for it
    pub fn schedule(&mut self, id: StrategyId, due_at: Instant) {
        match self.positions.get(&id).copied() {
            Some(pos) => {
                self.heap[pos].due_at = due_at;
                self.restore(pos);
            }
            None => {
                self.heap.push(RetryItem {
                    strategy_id: id,
                    due_at,
                });
                let pos = self.heap.len() - 1;
                self.positions.insert(id, pos);
                self.sift_up(pos);
            }
        }
    }

    /// Remove `id` if scheduled. Returns whether anything was removed.
    pub fn cancel(&mut self, id: StrategyId) -> bool {
        match self.positions.get(&id).copied() {
            Some(pos) => self.remove_at(pos).is_some(),
            None => false,
        }
    }

    /// Remove and return every entry due at or before `now`, earliest first
    pub fn pop_due(&mut self, now: Instant) -> Vec<RetryItem> {
        let mut due = Vec::new();
        while let Some(head) = self.heap.first() {
            if head.due_at > now {
                break;
            }
            match self.remove_at(0) {
                Some(item) => due.push(item),
                None => break,
            }
        }
        due
    }

    pub fn contains(&self, id: StrategyId) -> bool {
        self.positions.contains_key(&id)
    }

    pub fn due_at(&self, id: StrategyId) -> Option<Instant> {
        self.positions.get(&id).map(|&pos| self.heap[pos].due_at)
    }

    /// Earliest due time
    pub fn next_due(&self) -> Option<Instant> {
        self.heap.first().map(|item| item.due_at)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// All pending entries in unspecified order
    pub fn items(&self) -> Vec<RetryItem> {
        self.heap.clone()
    }

    fn remove_at(&mut self, pos: usize) -> Option<RetryItem> {
        let last = self.heap.len().checked_sub(1)?;
        self.swap(pos, last);
        let item = self.heap.pop()?;
        self.positions.remove(&item.strategy_id);
        if pos < self.heap.len() {
            self.restore(pos);
        }
        Some(item)
    }

    /// Move the entry at `pos` up or down until heap order holds again
    fn restore(&mut self, pos: usize) {
        if !self.sift_up(pos) {
            self.sift_down(pos);
        }
    }

    fn sift_up(&mut self, mut pos: usize) -> bool {
        let start = pos;
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.heap[pos].due_at >= self.heap[parent].due_at {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
        pos != start
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;
            if left < len && self.heap[left].due_at < self.heap[smallest].due_at {
                smallest = left;
            }
            if right < len && self.heap[right].due_at < self.heap[smallest].due_at {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        self.positions.insert(self.heap[a].strategy_id, a);
        self.positions.insert(self.heap[b].strategy_id, b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn secs(base: Instant, s: u64) -> Instant {
        base + Duration::from_secs(s)
    }

    /// Heap order and the position table agree
    fn check_invariants(scheduler: &RetryScheduler) {
        for (i, item) in scheduler.heap.iter().enumerate() {
            assert_eq!(scheduler.positions[&item.strategy_id], i);
            if i > 0 {
                assert!(scheduler.heap[(i - 1) / 2].due_at <= item.due_at);
            }
        }
        assert_eq!(scheduler.positions.len(), scheduler.heap.len());
    }

    #[test]
    fn test_pop_due_in_order() {
        let base = Instant::now();
        let mut scheduler = RetryScheduler::new();
        let ids: Vec<_> = (0..5).map(|_| StrategyId::new()).collect();
        for (i, id) in ids.iter().enumerate() {
            scheduler.schedule(*id, secs(base, 50 - i as u64 * 10));
        }
        check_invariants(&scheduler);

        let due = scheduler.pop_due(secs(base, 30));
        let due_ids: Vec<_> = due.iter().map(|d| d.strategy_id).collect();
        assert_eq!(due_ids, vec![ids[4], ids[3], ids[2]]);
        assert_eq!(scheduler.len(), 2);
        assert_eq!(scheduler.next_due(), Some(secs(base, 40)));
        check_invariants(&scheduler);
    }

    #[test]
    fn test_schedule_twice_fires_once_at_latest_time() {
        let base = Instant::now();
        let mut scheduler = RetryScheduler::new();
        let id = StrategyId::new();

        scheduler.schedule(id, secs(base, 15));
        scheduler.schedule(id, secs(base, 30));
        assert_eq!(scheduler.len(), 1);

        assert!(scheduler.pop_due(secs(base, 20)).is_empty());
        let due = scheduler.pop_due(secs(base, 30));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].due_at, secs(base, 30));
        assert!(scheduler.pop_due(secs(base, 100)).is_empty());
    }

    #[test]
    fn test_reschedule_earlier_moves_to_front() {
        let base = Instant::now();
        let mut scheduler = RetryScheduler::new();
        let a = StrategyId::new();
        let b = StrategyId::new();
        scheduler.schedule(a, secs(base, 10));
        scheduler.schedule(b, secs(base, 20));

        scheduler.schedule(b, secs(base, 5));
        check_invariants(&scheduler);
        assert_eq!(scheduler.pop_due(secs(base, 5))[0].strategy_id, b);
    }

    #[test]
    fn test_cancel() {
        let base = Instant::now();
        let mut scheduler = RetryScheduler::new();
        let ids: Vec<_> = (0..8).map(|_| StrategyId::new()).collect();
        for (i, id) in ids.iter().enumerate() {
            scheduler.schedule(*id, secs(base, (i as u64 * 7) % 11));
        }

        assert!(scheduler.cancel(ids[3]));
        assert!(!scheduler.cancel(ids[3]));
        assert!(!scheduler.contains(ids[3]));
        assert!(scheduler.cancel(ids[0]));
        check_invariants(&scheduler);

        let due = scheduler.pop_due(secs(base, 100));
        assert_eq!(due.len(), 6);
        for pair in due.windows(2) {
            assert!(pair[0].due_at <= pair[1].due_at);
        }
        assert!(scheduler.is_empty());
    }
}
