//! Shared pull-only work queue.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Mutually exclusive FIFO. Every item is handed to exactly one caller.
#[derive(Debug)]
pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> WorkQueue<T> {
    pub fn new<I: IntoIterator<Item = T>>(items: I) -> Self {
        Self {
            items: Mutex::new(items.into_iter().collect()),
        }
    }

    /// Remove and return the head, or `None` once exhausted
    pub fn next(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let queue = WorkQueue::new(vec![1, 2, 3]);
        assert_eq!(queue.next(), Some(1));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.next(), Some(2));
        assert_eq!(queue.next(), Some(3));
        assert_eq!(queue.next(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_concurrent_drain_delivers_each_item_once() {
        let queue = Arc::new(WorkQueue::new(0..10_000u32));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Some(item) = queue.next() {
                        got.push(item);
                    }
                    got
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for item in handle.join().unwrap() {
                total += 1;
                assert!(seen.insert(item), "item {} delivered twice", item);
            }
        }
        assert_eq!(total, 10_000);
    }
}
