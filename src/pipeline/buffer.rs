//! Gather stage accumulator shared by import workers.

use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug)]
struct BufferState<T> {
    items: Vec<T>,
    active: usize,
}

/// Accumulates finished items and tracks how many workers are still running
#[derive(Debug)]
pub struct EntryBuffer<T> {
    state: Mutex<BufferState<T>>,
}

impl<T> Default for EntryBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EntryBuffer<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BufferState {
                items: Vec::new(),
                active: 0,
            }),
        }
    }

    pub fn start_worker(&self) {
        self.state.lock().active += 1;
    }

    pub fn end_worker(&self) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
    }

    pub fn active_workers(&self) -> usize {
        self.state.lock().active
    }

    /// True once every started worker has ended
    pub fn all_finished(&self) -> bool {
        self.state.lock().active == 0
    }

    /// Add an item; returns the number of items now buffered
    pub fn push(&self, item: T) -> usize {
        let mut state = self.state.lock();
        state.items.push(item);
        state.items.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Take the current contents, leaving the buffer empty
    pub fn get_batch(&self) -> Vec<T> {
        std::mem::take(&mut self.state.lock().items)
    }

    /// Final drain: everything still buffered
    pub fn get_all(&self) -> Vec<T> {
        self.get_batch()
    }
}

/// Brackets one worker's lifetime: `start_worker` on creation,
/// `end_worker` on drop, including early returns and unwinding.
pub struct WorkerGuard<T> {
    buffer: Arc<EntryBuffer<T>>,
}

impl<T> WorkerGuard<T> {
    pub fn enter(buffer: Arc<EntryBuffer<T>>) -> Self {
        buffer.start_worker();
        Self { buffer }
    }
}

impl<T> Drop for WorkerGuard<T> {
    fn drop(&mut self) {
        self.buffer.end_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_clears_buffer() {
        let buffer = EntryBuffer::new();
        assert_eq!(buffer.push("a"), 1);
        assert_eq!(buffer.push("b"), 2);

        assert_eq!(buffer.get_batch(), vec!["a", "b"]);
        assert!(buffer.is_empty());

        buffer.push("c");
        assert_eq!(buffer.get_all(), vec!["c"]);
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn test_guard_tracks_workers() {
        let buffer = Arc::new(EntryBuffer::<u32>::new());
        assert!(buffer.all_finished());

        let first = WorkerGuard::enter(Arc::clone(&buffer));
        let second = WorkerGuard::enter(Arc::clone(&buffer));
        assert_eq!(buffer.active_workers(), 2);

        drop(first);
        assert!(!buffer.all_finished());
        drop(second);
        assert!(buffer.all_finished());
    }

    #[test]
    fn test_guard_ends_worker_on_panic() {
        let buffer = Arc::new(EntryBuffer::<u32>::new());
        let inner = Arc::clone(&buffer);

        let result = std::thread::spawn(move || {
            let _guard = WorkerGuard::enter(inner);
            panic!("worker died");
        })
        .join();

        assert!(result.is_err());
        assert!(buffer.all_finished());
    }
}
