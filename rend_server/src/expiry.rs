//! In-memory index of record deadlines.
//!
//! A min-heap of `(deadline, key)` pairs guarded by one mutex. Pushes
//! do not deduplicate: re-registering a key leaves the older entry in
//! the heap, and the cleaner neutralises it at pop time by comparing
//! the popped deadline against the one currently stored. The lock is
//! never held across store calls.

use rend_core::StorageKey;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Mutex;

/// One scheduled expiry: a storage key and its absolute deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryEntry {
    pub deadline_ns: u64,
    pub key: StorageKey,
}

impl Ord for ExpiryEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Deadline first; key bytes as a deterministic tie-break.
        (self.deadline_ns, &self.key).cmp(&(other.deadline_ns, &other.key))
    }
}

impl PartialOrd for ExpiryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Deadline-ordered index over every live (and some stale) storage key.
#[derive(Debug, Default)]
pub struct ExpiryIndex {
    heap: Mutex<BinaryHeap<Reverse<ExpiryEntry>>>,
}

impl ExpiryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `key` for expiry at `deadline_ns`. O(log n).
    pub fn push(&self, deadline_ns: u64, key: StorageKey) {
        self.heap
            .lock()
            .unwrap()
            .push(Reverse(ExpiryEntry { deadline_ns, key }));
    }

    /// Removes and returns every entry with `deadline <= now_ns`, in
    /// ascending deadline order.
    pub fn pop_due(&self, now_ns: u64) -> Vec<ExpiryEntry> {
        let mut heap = self.heap.lock().unwrap();
        let mut due = Vec::new();
        while heap
            .peek()
            .is_some_and(|entry| entry.0.deadline_ns <= now_ns)
        {
            if let Some(Reverse(entry)) = heap.pop() {
                due.push(entry);
            }
        }
        due
    }

    /// Replaces the index contents in bulk; used once at startup from
    /// a store scan. O(n).
    pub fn rebuild(&self, entries: Vec<(StorageKey, u64)>) {
        let heap = entries
            .into_iter()
            .map(|(key, deadline_ns)| Reverse(ExpiryEntry { deadline_ns, key }))
            .collect();
        *self.heap.lock().unwrap() = heap;
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> StorageKey {
        StorageKey::from_bytes(name.as_bytes().to_vec())
    }

    #[test]
    fn pops_due_entries_in_deadline_order() {
        let index = ExpiryIndex::new();
        index.push(180, key("c"));
        index.push(60, key("a"));
        index.push(120, key("b"));

        let due = index.pop_due(121);
        assert_eq!(
            due.iter().map(|e| e.deadline_ns).collect::<Vec<_>>(),
            vec![60, 120]
        );
        assert_eq!(index.len(), 1);

        assert!(index.pop_due(121).is_empty());
        let rest = index.pop_due(200);
        assert_eq!(rest, vec![ExpiryEntry {
            deadline_ns: 180,
            key: key("c"),
        }]);
        assert!(index.is_empty());
    }

    #[test]
    fn duplicate_keys_keep_both_entries() {
        let index = ExpiryIndex::new();
        index.push(60, key("a"));
        index.push(140, key("a"));
        assert_eq!(index.len(), 2);

        let first = index.pop_due(100);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].deadline_ns, 60);

        let second = index.pop_due(150);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].deadline_ns, 140);
    }

    #[test]
    fn rebuild_orders_arbitrary_input() {
        let index = ExpiryIndex::new();
        index.push(999, key("leftover"));
        index.rebuild(vec![(key("x"), 30), (key("y"), 10), (key("z"), 20)]);

        let due = index.pop_due(u64::MAX);
        assert_eq!(
            due.iter().map(|e| e.deadline_ns).collect::<Vec<_>>(),
            vec![10, 20, 30]
        );
    }

    #[test]
    fn nothing_due_returns_empty() {
        let index = ExpiryIndex::new();
        index.push(500, key("a"));
        assert!(index.pop_due(499).is_empty());
        assert_eq!(index.len(), 1);
    }
}
