//! Worker scheduling with optional work stealing.
//!
//! Each worker is a tokio task. It pulls from its own queue, then (if
//! stealing) from the other queues in a fixed order, and runs each item on
//! the blocking pool. One outcome is sent per finished item, the moment it
//! finishes.

use std::sync::Arc;

use log::debug;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::buffer::{EntryBuffer, WorkerGuard};
use super::queue::WorkQueue;
use crate::error::{VaultError, VaultResult};

/// One queue and the number of workers assigned to it
pub struct WorkerGroup<T> {
    pub queue: Arc<WorkQueue<T>>,
    pub workers: usize,
}

impl<T> WorkerGroup<T> {
    pub fn new(queue: Arc<WorkQueue<T>>, workers: usize) -> Self {
        Self { queue, workers }
    }
}

/// Result of one processed item
#[derive(Debug)]
pub enum Outcome<R> {
    Done(R),
    Failed(VaultError),
}

/// Handle on a running set of workers
pub struct WorkerPool<R> {
    pub outcomes: mpsc::UnboundedReceiver<Outcome<R>>,
    handles: Vec<JoinHandle<()>>,
}

impl<R> WorkerPool<R> {
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker task to exit
    pub async fn join(self) -> VaultResult<()> {
        for handle in self.handles {
            handle.await?;
        }
        Ok(())
    }
}

/// Spawn the workers. Must be called inside a tokio runtime.
///
/// `process` returning `Ok(None)` skips the item without an outcome. Errors
/// and panics inside `process` become `Outcome::Failed`; the worker keeps
/// going. Cancellation is checked between items only.
pub fn spawn_workers<T, R, B, F>(
    groups: Vec<WorkerGroup<T>>,
    stealing: bool,
    cancel: CancellationToken,
    buffer: Arc<EntryBuffer<B>>,
    process: Arc<F>,
) -> WorkerPool<R>
where
    T: Send + 'static,
    R: Send + 'static,
    B: Send + 'static,
    F: Fn(T) -> VaultResult<Option<R>> + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let queues: Vec<Arc<WorkQueue<T>>> = groups.iter().map(|g| Arc::clone(&g.queue)).collect();
    let mut handles = Vec::new();

    for (home, group) in groups.iter().enumerate() {
        // Fixed fallback order: own queue first, then the following ones
        let order: Vec<Arc<WorkQueue<T>>> = if stealing {
            (0..queues.len())
                .map(|i| Arc::clone(&queues[(home + i) % queues.len()]))
                .collect()
        } else {
            vec![Arc::clone(&queues[home])]
        };

        for worker in 0..group.workers {
            let order = order.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            let process = Arc::clone(&process);
            let buffer = Arc::clone(&buffer);

            handles.push(tokio::spawn(async move {
                let _guard = WorkerGuard::enter(buffer);
                let mut done = 0usize;

                loop {
                    if cancel.is_cancelled() {
                        debug!("Worker {}/{} cancelled after {} items", home, worker, done);
                        break;
                    }
                    let Some(item) = order.iter().find_map(|q| q.next()) else {
                        break;
                    };

                    let process = Arc::clone(&process);
                    let outcome = match tokio::task::spawn_blocking(move || (*process)(item)).await {
                        Ok(Ok(Some(result))) => Some(Outcome::Done(result)),
                        Ok(Ok(None)) => None,
                        Ok(Err(e)) => Some(Outcome::Failed(e)),
                        Err(join) => Some(Outcome::Failed(join.into())),
                    };
                    done += 1;

                    if let Some(outcome) = outcome {
                        if tx.send(outcome).is_err() {
                            debug!("Outcome receiver dropped, worker {}/{} stopping", home, worker);
                            break;
                        }
                    }
                }
            }));
        }
    }

    WorkerPool {
        outcomes: rx,
        handles,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn group(items: std::ops::Range<u32>, workers: usize) -> WorkerGroup<u32> {
        WorkerGroup::new(Arc::new(WorkQueue::new(items)), workers)
    }

    async fn collect<R>(mut pool: WorkerPool<R>) -> Vec<Outcome<R>> {
        let mut out = Vec::new();
        while let Some(outcome) = pool.outcomes.recv().await {
            out.push(outcome);
        }
        pool.join().await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_every_item_reported_once() {
        let buffer = Arc::new(EntryBuffer::<()>::new());
        let pool = spawn_workers(
            vec![group(0..5, 1), group(100..107, 3)],
            true,
            CancellationToken::new(),
            Arc::clone(&buffer),
            Arc::new(|item: u32| -> VaultResult<Option<u32>> { Ok(Some(item)) }),
        );
        assert_eq!(pool.worker_count(), 4);

        let outcomes = collect(pool).await;
        let ids: HashSet<u32> = outcomes
            .iter()
            .map(|o| match o {
                Outcome::Done(id) => *id,
                Outcome::Failed(e) => panic!("unexpected failure {}", e),
            })
            .collect();

        assert_eq!(outcomes.len(), 12);
        assert_eq!(ids.len(), 12);
        assert!(buffer.all_finished());
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_siblings() {
        let pool = spawn_workers(
            vec![group(0..10, 2)],
            false,
            CancellationToken::new(),
            Arc::new(EntryBuffer::<()>::new()),
            Arc::new(|item: u32| -> VaultResult<Option<u32>> {
                if item % 3 == 0 {
                    Err(VaultError::ImportFailed(format!("item {}", item)))
                } else if item == 4 {
                    Ok(None)
                } else {
                    Ok(Some(item))
                }
            }),
        );

        let outcomes = collect(pool).await;
        let failed = outcomes.iter().filter(|o| matches!(o, Outcome::Failed(_))).count();
        let done = outcomes.iter().filter(|o| matches!(o, Outcome::Done(_))).count();
        assert_eq!(failed, 4);
        assert_eq!(done, 5);
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let pool = spawn_workers(
            vec![group(0..3, 1)],
            false,
            CancellationToken::new(),
            Arc::new(EntryBuffer::<()>::new()),
            Arc::new(|item: u32| -> VaultResult<Option<u32>> {
                if item == 1 {
                    panic!("bad item");
                }
                Ok(Some(item))
            }),
        );

        let outcomes = collect(pool).await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, Outcome::Failed(VaultError::TaskFailed(_)))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_idle_workers_steal() {
        let start = Instant::now();
        let pool = spawn_workers(
            vec![group(0..12, 1), group(0..0, 3)],
            true,
            CancellationToken::new(),
            Arc::new(EntryBuffer::<()>::new()),
            Arc::new(|item: u32| -> VaultResult<Option<u32>> {
                std::thread::sleep(Duration::from_millis(100));
                Ok(Some(item))
            }),
        );

        let outcomes = collect(pool).await;
        assert_eq!(outcomes.len(), 12);
        // 12 x 100ms over 4 workers is ~300ms; without stealing it is 1200ms
        assert!(start.elapsed() < Duration::from_millis(800), "{:?}", start.elapsed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancellation_stops_new_work() {
        let cancel = CancellationToken::new();
        let processed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&processed);

        let pool = spawn_workers(
            vec![group(0..20, 2)],
            false,
            cancel.clone(),
            Arc::new(EntryBuffer::<()>::new()),
            Arc::new(move |item: u32| -> VaultResult<Option<u32>> {
                std::thread::sleep(Duration::from_millis(50));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Some(item))
            }),
        );

        tokio::time::sleep(Duration::from_millis(120)).await;
        cancel.cancel();
        let outcomes = collect(pool).await;

        let total = processed.load(Ordering::SeqCst);
        assert!(total < 20, "processed {}", total);
        assert_eq!(outcomes.len(), total);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_workers_run_concurrently() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (c, p) = (Arc::clone(&current), Arc::clone(&peak));

        let pool = spawn_workers(
            vec![group(0..12, 3)],
            false,
            CancellationToken::new(),
            Arc::new(EntryBuffer::<()>::new()),
            Arc::new(move |item: u32| -> VaultResult<Option<u32>> {
                let now = c.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(40));
                c.fetch_sub(1, Ordering::SeqCst);
                Ok(Some(item))
            }),
        );

        assert_eq!(collect(pool).await.len(), 12);
        assert!(peak.load(Ordering::SeqCst) >= 3);
    }
}
