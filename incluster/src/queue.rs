use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::types::PendingItem;

/// Ordered buffer of items waiting for a reconciliation pass.
///
/// Implementations must be safe for concurrent `push` from many callers
/// alongside one `pop_batch` caller, without losing or duplicating items.
pub trait DeferralQueue: Send + Sync {
    /// Appends an item at the tail.
    fn push(&self, item: PendingItem);

    /// Removes up to `max` items from the head. Never blocks; returns
    /// whatever is available, possibly nothing.
    fn pop_batch(&self, max: usize) -> Vec<PendingItem>;

    /// Puts previously popped items back at the head, keeping their order,
    /// so a failed pass can be retried with the same batch.
    fn restore(&self, items: Vec<PendingItem>);

    /// Returns the number of queued items.
    fn len(&self) -> usize;

    /// Returns true if nothing is queued.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory FIFO [`DeferralQueue`].
#[derive(Default)]
pub struct MemoryQueue {
    items: Mutex<VecDeque<PendingItem>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeferralQueue for MemoryQueue {
    fn push(&self, item: PendingItem) {
        self.items.lock().push_back(item);
    }

    fn pop_batch(&self, max: usize) -> Vec<PendingItem> {
        let mut items = self.items.lock();
        let n = max.min(items.len());
        items.drain(..n).collect()
    }

    fn restore(&self, items: Vec<PendingItem>) {
        let mut queue = self.items.lock();
        for item in items.into_iter().rev() {
            queue.push_front(item);
        }
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn item(id: &str) -> PendingItem {
        PendingItem::new(id, vec![1.0, 0.0])
    }

    fn ids(items: &[PendingItem]) -> Vec<&str> {
        items.iter().map(|i| i.item_id.as_str()).collect()
    }

    #[test]
    fn fifo_order() {
        let q = MemoryQueue::new();
        q.push(item("a"));
        q.push(item("b"));
        q.push(item("c"));
        assert_eq!(q.len(), 3);

        let batch = q.pop_batch(2);
        assert_eq!(ids(&batch), vec!["a", "b"]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn pop_more_than_available() {
        let q = MemoryQueue::new();
        q.push(item("a"));
        let batch = q.pop_batch(10);
        assert_eq!(ids(&batch), vec!["a"]);
        assert!(q.is_empty());
    }

    #[test]
    fn pop_empty_returns_immediately() {
        let q = MemoryQueue::new();
        assert!(q.pop_batch(5).is_empty());
        assert!(q.pop_batch(0).is_empty());
    }

    #[test]
    fn restore_puts_items_back_at_head() {
        let q = MemoryQueue::new();
        for id in ["a", "b", "c", "d"] {
            q.push(item(id));
        }
        let batch = q.pop_batch(2);
        q.push(item("e"));
        q.restore(batch);

        let all = q.pop_batch(10);
        assert_eq!(ids(&all), vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn no_dedup() {
        let q = MemoryQueue::new();
        q.push(item("a"));
        q.push(item("a"));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn concurrent_push_and_pop_lose_nothing() {
        let q = Arc::new(MemoryQueue::new());
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..250 {
                        q.push(item(&format!("{p}-{i}")));
                    }
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let mut got = Vec::new();
                while got.len() < 1000 {
                    got.extend(q.pop_batch(64));
                    thread::yield_now();
                }
                got
            })
        };

        for p in producers {
            p.join().unwrap();
        }
        for it in consumer.join().unwrap() {
            assert!(seen.insert(it.item_id), "duplicate item");
        }
        assert_eq!(seen.len(), 1000);
        assert!(q.is_empty());
    }
}
