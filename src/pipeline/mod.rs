//! ALFA Vault Store - Parallel Import Pipeline
//!
//! Sources are split into a video queue and an "other" queue, worked by
//! independent worker groups that steal from each other once their own
//! queue runs dry. Container space for each queue is reserved up front in
//! queue order. Every item produces exactly one event the moment it
//! finishes. Prepared entries are gathered and committed into the index:
//! per item for small runs, periodically inside index batch mode for large
//! ones.

pub mod buffer;
pub mod queue;
pub mod workers;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::allocator::{BlobAllocation, BlobAllocator, PreparedEntry, SourceFile};
use crate::config::StoreConfig;
use crate::crypto::{MasterKey, VaultKey};
use crate::error::{VaultError, VaultResult};
use crate::index::{BatchGuard, IndexManager, VaultFileItem};
use crate::thumbs::{thumbnail_for_source, ThumbnailCache, ThumbnailGenerator};

pub use buffer::{EntryBuffer, WorkerGuard};
pub use queue::WorkQueue;
pub use workers::{spawn_workers, Outcome, WorkerGroup, WorkerPool};

/// Progress event, one per finished item
#[derive(Debug, Clone, PartialEq)]
pub enum ImportEvent {
    Imported(VaultFileItem),
    Failed { reason: Option<String> },
}

/// Aggregate result of one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: usize,
    pub failed: usize,
    /// Last observed failure, if any
    pub failure_reason: Option<String>,
    pub cancelled: bool,
}

impl ImportSummary {
    fn record_failure(&mut self, count: usize, reason: String) {
        self.failed += count;
        self.failure_reason = Some(reason);
    }
}

/// Queue a source belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Video,
    Other,
}

impl Category {
    pub fn of(source: &SourceFile) -> Self {
        if source.is_video() {
            Category::Video
        } else {
            Category::Other
        }
    }
}

/// A running import: drain `events`, then await [`ImportRun::finish`]
pub struct ImportRun {
    pub events: mpsc::UnboundedReceiver<ImportEvent>,
    driver: JoinHandle<VaultResult<ImportSummary>>,
}

impl ImportRun {
    /// Wait for the final commit and return the summary
    pub async fn finish(self) -> VaultResult<ImportSummary> {
        self.driver.await?
    }

    /// Drain remaining events, calling `on_event` for each, then finish
    pub async fn drain<F: FnMut(&ImportEvent)>(mut self, mut on_event: F) -> VaultResult<ImportSummary> {
        while let Some(event) = self.events.recv().await {
            on_event(&event);
        }
        self.finish().await
    }
}

/// A source with the region reserved for it, or the reason it has none
struct WorkItem {
    source: SourceFile,
    allocation: VaultResult<BlobAllocation>,
}

/// Everything a worker needs to turn one source into a prepared entry
struct RunContext {
    key: VaultKey,
    master: Option<MasterKey>,
    batch_mode: bool,
    commit_every: usize,
    thumbnail_max_source: u64,
    allocator: Arc<BlobAllocator>,
    generator: Arc<dyn ThumbnailGenerator>,
    cache: Arc<dyn ThumbnailCache>,
    buffer: Arc<EntryBuffer<PreparedEntry>>,
    /// Entries lost to failed periodic commits, and the last reason
    lost: AtomicUsize,
    lost_reason: Mutex<Option<String>>,
}

impl RunContext {
    fn process(&self, work: WorkItem) -> VaultResult<Option<ImportEvent>> {
        let allocation = work.allocation?;
        let master = self
            .master
            .as_ref()
            .ok_or_else(|| VaultError::ImportFailed("no content key for this run".into()))?;

        let thumbnail = thumbnail_for_source(self.generator.as_ref(), &work.source, self.thumbnail_max_source);
        let prepared = self
            .allocator
            .prepare_file_entry(&work.source, thumbnail, master, &allocation)?;
        let item = prepared.item();

        if self.batch_mode {
            if self.buffer.push(prepared) >= self.commit_every {
                self.commit(self.buffer.get_batch());
            }
        } else {
            self.allocator.commit_entries(std::slice::from_ref(&prepared), &self.key)?;
            self.cache_thumbnails(std::slice::from_ref(&prepared));
        }

        Ok(Some(ImportEvent::Imported(item)))
    }

    /// Gather step; a failure is recorded against the run, not the item
    fn commit(&self, batch: Vec<PreparedEntry>) {
        if batch.is_empty() {
            return;
        }
        match self.allocator.commit_entries(&batch, &self.key) {
            Ok(_) => self.cache_thumbnails(&batch),
            Err(e) => {
                warn!("Commit of {} prepared entries failed: {}", batch.len(), e);
                self.lost.fetch_add(batch.len(), Ordering::SeqCst);
                *self.lost_reason.lock() = Some(e.to_string());
            }
        }
    }

    fn cache_thumbnails(&self, batch: &[PreparedEntry]) {
        for prepared in batch {
            if let Some(thumb) = &prepared.thumbnail_plain {
                self.cache.put(prepared.entry.file_id, thumb.clone());
            }
        }
    }
}

/// Reserve space for a whole queue with one allocator call, so regions
/// follow queue order. Sources that cannot be sized carry their error.
fn reserve_queue(
    allocator: &BlobAllocator,
    key: &VaultKey,
    sources: Vec<SourceFile>,
    master: &mut Option<MasterKey>,
) -> VaultResult<Vec<WorkItem>> {
    let mut sizes = Vec::new();
    let mut sized = Vec::with_capacity(sources.len());
    for source in sources {
        match std::fs::metadata(&source.path) {
            Ok(meta) => {
                sizes.push(allocator.estimate_size(meta.len()));
                sized.push((source, true));
            }
            Err(_) => sized.push((source, false)),
        }
    }

    let mut regions = if sizes.is_empty() {
        Vec::new().into_iter()
    } else {
        let (allocations, content_key) = allocator.allocate_batch_space(&sizes, key)?;
        *master = Some(content_key);
        allocations.into_iter()
    };

    Ok(sized
        .into_iter()
        .map(|(source, readable)| {
            let allocation = if readable {
                regions
                    .next()
                    .ok_or_else(|| VaultError::ImportFailed("allocator returned too few regions".into()))
            } else {
                Err(VaultError::FileNotFound(source.path.display().to_string()))
            };
            WorkItem { source, allocation }
        })
        .collect())
}

/// Import Pipeline
#[derive(Clone)]
pub struct ImportPipeline {
    indexes: Arc<IndexManager>,
    allocator: Arc<BlobAllocator>,
    generator: Arc<dyn ThumbnailGenerator>,
    cache: Arc<dyn ThumbnailCache>,
    config: StoreConfig,
}

impl ImportPipeline {
    pub fn new(
        indexes: Arc<IndexManager>,
        allocator: Arc<BlobAllocator>,
        generator: Arc<dyn ThumbnailGenerator>,
        cache: Arc<dyn ThumbnailCache>,
        config: StoreConfig,
    ) -> Self {
        Self {
            indexes,
            allocator,
            generator,
            cache,
            config,
        }
    }

    /// Start importing `sources` into the vault unlocked by `key`.
    /// Must be called inside a tokio runtime.
    pub fn start(&self, key: &VaultKey, sources: Vec<SourceFile>, cancel: CancellationToken) -> ImportRun {
        // Closed by the driver on every exit path, including early errors
        let batch = (sources.len() >= self.config.batch_mode_threshold)
            .then(|| BatchGuard::begin(Arc::clone(&self.indexes), key));

        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = self.clone();
        let key = key.clone();
        let driver = tokio::spawn(async move { pipeline.drive(key, sources, batch, tx, cancel).await });

        ImportRun { events: rx, driver }
    }

    /// Import and wait, forwarding each event to `on_event`
    pub async fn run<F: FnMut(&ImportEvent)>(
        &self,
        key: &VaultKey,
        sources: Vec<SourceFile>,
        cancel: CancellationToken,
        on_event: F,
    ) -> VaultResult<ImportSummary> {
        self.start(key, sources, cancel).drain(on_event).await
    }

    fn worker_groups(&self, videos: Vec<WorkItem>, others: Vec<WorkItem>) -> Vec<WorkerGroup<WorkItem>> {
        let mut video_workers = self.config.video_workers;
        let mut other_workers = self.config.other_workers;

        // Without stealing, a non-empty queue with no workers would never drain
        if !self.config.work_stealing {
            if !videos.is_empty() && video_workers == 0 {
                video_workers = 1;
            }
            if !others.is_empty() && other_workers == 0 {
                other_workers = 1;
            }
        }

        vec![
            WorkerGroup::new(Arc::new(WorkQueue::new(videos)), video_workers),
            WorkerGroup::new(Arc::new(WorkQueue::new(others)), other_workers),
        ]
    }

    /// Reserve space, run the workers, forward outcomes as events, then do
    /// the final drain-and-commit once every worker has exited.
    async fn drive(
        self,
        key: VaultKey,
        sources: Vec<SourceFile>,
        batch: Option<BatchGuard>,
        events: mpsc::UnboundedSender<ImportEvent>,
        cancel: CancellationToken,
    ) -> VaultResult<ImportSummary> {
        let total = sources.len();
        let (videos, others): (Vec<_>, Vec<_>) = sources
            .into_iter()
            .partition(|s| Category::of(s) == Category::Video);

        let allocator = Arc::clone(&self.allocator);
        let reserve_key = key.clone();
        let reserved = tokio::task::spawn_blocking(move || {
            let mut master = None;
            let videos = reserve_queue(&allocator, &reserve_key, videos, &mut master)?;
            let others = reserve_queue(&allocator, &reserve_key, others, &mut master)?;
            Ok::<_, VaultError>((videos, others, master))
        })
        .await?;

        let (videos, others, master) = match reserved {
            Ok(reserved) => reserved,
            Err(e) => {
                error!("Could not reserve container space: {}", e);
                return Err(e);
            }
        };

        let ctx = Arc::new(RunContext {
            key,
            master,
            batch_mode: batch.is_some(),
            commit_every: self.config.commit_every.max(1),
            thumbnail_max_source: self.config.thumbnail_max_source,
            allocator: Arc::clone(&self.allocator),
            generator: Arc::clone(&self.generator),
            cache: Arc::clone(&self.cache),
            buffer: Arc::new(EntryBuffer::new()),
            lost: AtomicUsize::new(0),
            lost_reason: Mutex::new(None),
        });

        let worker_ctx = Arc::clone(&ctx);
        let mut pool = spawn_workers(
            self.worker_groups(videos, others),
            self.config.work_stealing,
            cancel.clone(),
            Arc::clone(&ctx.buffer),
            Arc::new(move |work: WorkItem| worker_ctx.process(work)),
        );

        let mut summary = ImportSummary::default();
        while let Some(outcome) = pool.outcomes.recv().await {
            let event = match outcome {
                Outcome::Done(event) => event,
                Outcome::Failed(e) => {
                    if e.is_item_local() {
                        warn!("Import item failed: {}", e);
                    } else {
                        error!("Import item hit a store-level error: {}", e);
                    }
                    ImportEvent::Failed {
                        reason: Some(e.to_string()),
                    }
                }
            };
            match &event {
                ImportEvent::Imported(_) => summary.imported += 1,
                ImportEvent::Failed { reason } => {
                    summary.record_failure(1, reason.clone().unwrap_or_else(|| "unknown".into()))
                }
            }
            // A dropped receiver only means nobody is watching progress
            let _ = events.send(event);
        }
        drop(events);
        pool.join().await?;

        if !ctx.buffer.all_finished() {
            warn!("Final drain with {} worker(s) still registered", ctx.buffer.active_workers());
        }

        let final_ctx = Arc::clone(&ctx);
        let end_batch = tokio::task::spawn_blocking(move || {
            final_ctx.commit(final_ctx.buffer.get_all());
            batch.map_or(Ok(()), BatchGuard::finish)
        })
        .await?;

        let lost = ctx.lost.load(Ordering::SeqCst);
        if lost > 0 {
            summary.imported = summary.imported.saturating_sub(lost);
            let reason = ctx
                .lost_reason
                .lock()
                .clone()
                .unwrap_or_else(|| "commit failed".into());
            summary.record_failure(lost, reason);
        }
        if let Err(e) = end_batch {
            warn!("Final index flush failed: {}", e);
            summary.failure_reason = Some(e.to_string());
        }

        summary.cancelled = cancel.is_cancelled() && summary.imported + summary.failed < total;
        info!(
            "Import finished: {} imported, {} failed of {}{}",
            summary.imported,
            summary.failed,
            total,
            if summary.cancelled { " (cancelled)" } else { "" }
        );
        Ok(summary)
    }
}
