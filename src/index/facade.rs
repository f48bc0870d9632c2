//! Keeps an [`IndexEngine`] in sync with a [`Mirror`] and answers searches with paths.
//!
//! Files announced by the mirror are first held in a throttle queue until they have been
//! quiet for the throttle delay, then promoted into the add queue, ordered by length so
//! small files become searchable first. Each iteration of the facade's loop performs one
//! of, in priority order: a promotion, a removal, an addition, a retry of a failed hard link
//! cleanup.

use crate::background::{BackgroundLoop, Iteration, LoopContext, LoopError, LoopEvent};
use crate::collections::{lock, FifoMap, FifoSet, OrderedMap, SetGrouping};
use crate::fs::filter::FileNameFilter;
use crate::fs::mirror::{Mirror, MirrorListener, MirrorOptions, MirrorTree};
use crate::fs::model::{ContentId, ContentIdSequence, EntryAccessError, FileEntry, WatchTarget};
use crate::index::engine::{FileSearchResult, IndexEngine};
use crate::index::processor::{IndexingTaskProcessor, ProcessingOutcome, ProcessorOptions};
use crate::index::query::{Query, QueryBuilder};
use crate::index::task::{IndexingAction, IndexingTask};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Order in which throttled files are indexed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheduling {
    /// Smaller files first.
    #[default]
    SmallestFirst,
    /// In the order their throttle delay elapsed.
    ArrivalOrder,
}

#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub idle_delay: Duration,
    /// Quiet period before a changed file is queued for indexing. Must not be shorter than
    /// the mirror's path synchronization lag.
    pub throttle_delay: Duration,
    pub scheduling: Scheduling,
    pub processor: ProcessorOptions,
}

impl IndexOptions {
    /// Reject settings the indexer cannot run with. The throttle delay must cover the
    /// mirror's path synchronization lag, or a moved file could be read at a stale path.
    pub fn validate(&self, mirror: &MirrorOptions) -> Result<()> {
        if self.idle_delay.is_zero() {
            bail!("index idle delay must be positive");
        }
        if self.throttle_delay < mirror.allowable_path_synchronization_lag {
            bail!(
                "throttle delay ({:?}) must not be shorter than the path synchronization lag ({:?})",
                self.throttle_delay,
                mirror.allowable_path_synchronization_lag
            );
        }
        if self.processor.max_read_attempts == 0 {
            bail!("at least one read attempt is required");
        }
        if self.processor.max_file_length == 0 {
            bail!("maximum file length must be positive");
        }
        Ok(())
    }
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            idle_delay: Duration::from_millis(100),
            throttle_delay: Duration::from_millis(400),
            scheduling: Scheduling::SmallestFirst,
            processor: ProcessorOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum IndexEvent {
    BeginProcessing {
        action: IndexingAction,
        content_id: ContentId,
        path: Option<PathBuf>,
    },
    EndProcessing {
        action: IndexingAction,
        content_id: ContentId,
        path: Option<PathBuf>,
        indexed: bool,
    },
    AccessError(EntryAccessError),
}

/// Sizes of the facade's queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingWork {
    pub delayed: usize,
    pub adding: usize,
    pub removing: usize,
    pub processing: bool,
}

impl PendingWork {
    pub fn is_empty(&self) -> bool {
        self.delayed == 0 && self.adding == 0 && self.removing == 0 && !self.processing
    }
}

#[derive(Debug)]
struct CurrentTask {
    action: IndexingAction,
    file: Option<FileEntry>,
    token: CancellationToken,
}

struct FacadeShared {
    tree: Arc<MirrorTree>,
    engine: Arc<dyn IndexEngine>,
    processor: IndexingTaskProcessor,
    throttle_delay: Duration,
    path_synchronization_lag: Duration,
    scheduling: Scheduling,
    token: CancellationToken,
    delayed: FifoMap<FileEntry, IndexingTask>,
    adding: OrderedMap<FileEntry, IndexingTask, u64>,
    removing: FifoMap<ContentId, IndexingTask>,
    failed_hardlinks: FifoSet<PathBuf>,
    files_by_content_id: SetGrouping<ContentId, FileEntry>,
    current: Mutex<Option<CurrentTask>>,
    events: broadcast::Sender<IndexEvent>,
}

/// Watches files and keeps their content searchable.
pub struct IndexFacade {
    mirror: Mirror,
    shared: Arc<FacadeShared>,
    background: BackgroundLoop,
}

impl IndexFacade {
    pub fn new(
        engine: Arc<dyn IndexEngine>,
        mirror_options: MirrorOptions,
        options: IndexOptions,
        filter: FileNameFilter,
    ) -> Result<Self> {
        mirror_options.validate()?;
        options.validate(&mirror_options)?;
        engine
            .initialize()
            .context("Failed to initialize index engine")?;

        // temporary hard links must never be indexed themselves
        let mut filter = filter.exclude_directory(&options.processor.hardlink_directory_name);
        if let Some(name) = options
            .processor
            .hardlink_directory
            .as_ref()
            .and_then(|directory| directory.file_name())
        {
            filter = filter.exclude_directory(&name.to_string_lossy());
        }

        let path_synchronization_lag = mirror_options.allowable_path_synchronization_lag;
        let mirror = Mirror::new(mirror_options, Arc::new(ContentIdSequence::new()), filter)?;
        let background = BackgroundLoop::new("index", options.idle_delay)?;
        let (events, _) = broadcast::channel(1024);

        let shared = Arc::new(FacadeShared {
            tree: mirror.tree(),
            processor: IndexingTaskProcessor::new(engine.clone(), options.processor),
            engine,
            throttle_delay: options.throttle_delay,
            path_synchronization_lag,
            scheduling: options.scheduling,
            token: background.cancellation_token(),
            delayed: FifoMap::new(),
            adding: OrderedMap::new(),
            removing: FifoMap::new(),
            failed_hardlinks: FifoSet::new(),
            files_by_content_id: SetGrouping::new(),
            current: Mutex::new(None),
            events,
        });
        mirror.add_listener(shared.clone());

        Ok(Self {
            mirror,
            shared,
            background,
        })
    }

    /// Register a watch target. Idempotent.
    pub fn watch(&self, target: WatchTarget) {
        self.mirror.watch(target);
    }

    /// Evaluate `query` and map the matching content ids to their current paths.
    pub fn search(&self, query: &Query) -> FileSearchResult {
        let result = self.shared.engine.search(query);
        if !result.syntax_errors.is_empty() {
            return FileSearchResult {
                syntax_errors: result.syntax_errors,
                warnings: result.warnings,
                ..FileSearchResult::default()
            };
        }

        let file_names = result
            .content_ids
            .iter()
            .flat_map(|content_id| self.shared.files_by_content_id.get(content_id))
            .filter_map(|file| self.shared.tree.path(file.id))
            .collect();

        FileSearchResult {
            file_names,
            syntax_errors: Vec::new(),
            warnings: result.warnings,
        }
    }

    /// Parse `text` with the engine's query syntax and search for it.
    pub fn search_text(&self, text: &str) -> FileSearchResult {
        self.search(&self.query_builder().parse(text))
    }

    pub fn query_builder(&self) -> Arc<dyn QueryBuilder> {
        self.shared.engine.query_builder()
    }

    pub fn engine(&self) -> &Arc<dyn IndexEngine> {
        &self.shared.engine
    }

    pub fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    pub fn pending(&self) -> PendingWork {
        PendingWork {
            delayed: self.shared.delayed.len(),
            adding: self.shared.adding.len(),
            removing: self.shared.removing.len(),
            processing: lock(&self.shared.current).is_some(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.shared.events.subscribe()
    }

    pub fn subscribe_loop(&self) -> broadcast::Receiver<LoopEvent> {
        self.background.subscribe()
    }

    /// Start the mirror and the indexing worker.
    pub fn run(&self) -> Result<(), LoopError> {
        self.mirror.run()?;
        self.background.run(IndexWorker {
            shared: self.shared.clone(),
        })?;
        info!("Index facade started");
        Ok(())
    }

    /// Stop both workers and delete temporary hard link directories. Returns the first
    /// worker failure.
    pub fn dispose(&self) -> Result<(), LoopError> {
        let mirror = self.mirror.dispose();
        let index = self.background.dispose();
        self.shared.processor.dispose();
        mirror.and(index)
    }
}

struct IndexWorker {
    shared: Arc<FacadeShared>,
}

impl Iteration for IndexWorker {
    fn iteration(&mut self, ctx: &LoopContext) -> Result<()> {
        let shared = &self.shared;

        if shared.promote_delayed() {
            return Ok(());
        }

        if let Some(task) = shared.begin(|| shared.removing.try_dequeue().map(|(_, task)| task)) {
            return shared.process(task);
        }

        if let Some(task) = shared.begin(|| shared.adding.try_remove_min().map(|(_, task)| task)) {
            return shared.process(task);
        }

        if let Some(link) = shared.failed_hardlinks.try_dequeue() {
            match std::fs::remove_file(&link) {
                Ok(()) => debug!(link = %link.display(), "Removed leftover hard link"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    trace!(link = %link.display(), error = %e, "Hard link still locked");
                    shared.failed_hardlinks.try_enqueue(link);
                    ctx.idle();
                }
            }
            return Ok(());
        }

        ctx.idle();
        Ok(())
    }
}

impl FacadeShared {
    fn publish(&self, event: IndexEvent) {
        let _ = self.events.send(event);
    }

    /// Move the oldest throttled task into the add queue once its delay has elapsed.
    fn promote_delayed(&self) -> bool {
        let Some((file, task)) = self.delayed.try_peek() else {
            return false;
        };
        if task.created.elapsed() < self.throttle_delay {
            return false;
        }
        let Some(task) = self.delayed.try_remove(&file) else {
            return false;
        };

        let order = match self.scheduling {
            Scheduling::SmallestFirst => task.length.unwrap_or_default(),
            Scheduling::ArrivalOrder => 0,
        };
        trace!(task = %task, "Throttle delay elapsed");
        self.adding.add(file, task, order);
        true
    }

    /// Dequeue a task and mark it current in one step, so deletes and moves observed in
    /// between can cancel it.
    fn begin(&self, dequeue: impl FnOnce() -> Option<IndexingTask>) -> Option<IndexingTask> {
        let mut current = lock(&self.current);
        let task = dequeue()?;
        *current = Some(CurrentTask {
            action: task.action,
            file: task.file.clone(),
            token: task.token().clone(),
        });
        Some(task)
    }

    fn process(&self, task: IndexingTask) -> Result<()> {
        self.publish(IndexEvent::BeginProcessing {
            action: task.action,
            content_id: task.content_id,
            path: task.path.clone(),
        });
        debug!(task = %task, "Processing");

        let outcome = self.processor.process(&task);
        *lock(&self.current) = None;
        let outcome: ProcessingOutcome = outcome?;

        self.publish(IndexEvent::EndProcessing {
            action: task.action,
            content_id: task.content_id,
            path: task.path.clone(),
            indexed: outcome.indexed,
        });

        if outcome.has_to_be_repeated && !task.is_cancelled() {
            self.add_delayed(task.create_repetition_task(&self.token));
        }
        if let Some(error) = outcome.access_error {
            self.publish(IndexEvent::AccessError(error));
        }
        if let Some(link) = outcome.failed_hardlink {
            self.failed_hardlinks.try_enqueue(link);
        }
        Ok(())
    }

    fn add_delayed(&self, mut task: IndexingTask) {
        let Some(file) = task.file.clone() else {
            return;
        };
        if !task.resolve(&self.tree) {
            trace!(content_id = %task.content_id, "File vanished before it was queued");
            return;
        }

        trace!(task = %task, "Delaying");
        self.files_by_content_id.try_add(task.content_id, file.clone());
        self.delayed.try_enqueue(file, task);
    }

    fn is_current(current: &Option<CurrentTask>, file: &FileEntry) -> Option<CancellationToken> {
        current.as_ref().and_then(|task| {
            (task.action == IndexingAction::AddContent && task.file.as_ref() == Some(file))
                .then(|| task.token.clone())
        })
    }

    fn remove(&self, file: &FileEntry) {
        let Some(content_id) = file.content_id() else {
            return;
        };

        let current = lock(&self.current);
        self.files_by_content_id.try_remove(&content_id, file);
        self.delayed.try_remove(file);
        self.adding.try_remove(file);
        if let Some(token) = Self::is_current(&current, file) {
            token.cancel();
        }

        let siblings = self.files_by_content_id.get(&content_id);
        if siblings.is_empty() {
            trace!(content_id = %content_id, "Queueing removal");
            self.removing.try_enqueue(content_id, IndexingTask::remove(content_id, &self.token));
        } else if file.metadata.indexed_at().is_some() {
            // the content is still indexed, now on behalf of the remaining paths
            for sibling in siblings {
                if sibling.metadata.indexed_at().is_none() {
                    sibling.metadata.mark_indexed();
                }
            }
        }
    }

    fn moved(&self, file: &FileEntry) {
        let Some(content_id) = file.content_id() else {
            return;
        };

        let reindex = {
            let current = lock(&self.current);
            let mut reindex = false;
            if let Some(token) = Self::is_current(&current, file) {
                token.cancel();
                reindex = true;
            }
            reindex |= self.adding.try_remove(file).is_some();
            reindex |= self.delayed.try_remove(file).is_some();

            // indexed moments before the move, the content may belong to another file
            let indexed_at = self
                .files_by_content_id
                .get(&content_id)
                .iter()
                .filter_map(|sibling| sibling.metadata.indexed_at())
                .max();
            reindex |= match indexed_at {
                Some(indexed_at) => indexed_at.elapsed() < self.path_synchronization_lag,
                None => true,
            };
            reindex
        };

        if reindex {
            if let Some(task) = IndexingTask::add(file.clone(), &self.token) {
                self.add_delayed(task);
            }
        }
    }
}

impl MirrorListener for FacadeShared {
    fn file_created(&self, file: &FileEntry) {
        if let Some(task) = IndexingTask::add(file.clone(), &self.token) {
            self.add_delayed(task);
        }
    }

    fn file_deleted(&self, file: &FileEntry) {
        self.remove(file);
    }

    fn file_moved(&self, file: &FileEntry) {
        self.moved(file);
    }

    fn access_error(&self, error: &EntryAccessError) {
        warn!(error = %error, "Mirror access error");
        self.publish(IndexEvent::AccessError(error.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::model::{EntryKind, Metadata};
    use crate::index::memory::MemoryIndexEngine;
    use std::path::Path;
    use std::time::Instant;
    use tempfile::TempDir;

    fn mirror_options() -> MirrorOptions {
        MirrorOptions {
            idle_delay: Duration::from_millis(10),
            allowable_path_synchronization_lag: Duration::from_millis(20),
            debounce: Duration::from_millis(20),
        }
    }

    fn index_options(dir: &Path) -> IndexOptions {
        IndexOptions {
            idle_delay: Duration::from_millis(10),
            throttle_delay: Duration::from_millis(20),
            scheduling: Scheduling::SmallestFirst,
            processor: ProcessorOptions {
                hardlink_directory: Some(dir.join("links")),
                ..ProcessorOptions::default()
            },
        }
    }

    fn facade(links: &TempDir) -> IndexFacade {
        IndexFacade::new(
            Arc::new(MemoryIndexEngine::new()),
            mirror_options(),
            index_options(links.path()),
            FileNameFilter::accept_all(),
        )
        .unwrap()
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        condition()
    }

    /// A tracked file whose tree node is added without involving the mirror worker.
    fn tracked_file(facade: &IndexFacade, path: &Path, content_id: u64) -> FileEntry {
        let metadata = Arc::new(Metadata::new(Some(ContentId(content_id))));
        let id = facade
            .shared
            .tree
            .add(EntryKind::File, path, metadata.clone())
            .unwrap();
        FileEntry { id, metadata }
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        let links = TempDir::new().unwrap();
        let build = |mirror: MirrorOptions, options: IndexOptions| {
            IndexFacade::new(
                Arc::new(MemoryIndexEngine::new()),
                mirror,
                options,
                FileNameFilter::accept_all(),
            )
        };

        let short_throttle = IndexOptions {
            throttle_delay: Duration::from_millis(5),
            ..index_options(links.path())
        };
        let error = build(mirror_options(), short_throttle).err().unwrap();
        assert!(error.to_string().contains("throttle delay"));

        let no_idle = IndexOptions {
            idle_delay: Duration::ZERO,
            ..index_options(links.path())
        };
        assert!(build(mirror_options(), no_idle).is_err());

        let mirror_without_idle = MirrorOptions {
            idle_delay: Duration::ZERO,
            ..mirror_options()
        };
        assert!(build(mirror_without_idle, index_options(links.path())).is_err());

        let mut no_attempts = index_options(links.path());
        no_attempts.processor.max_read_attempts = 0;
        assert!(build(mirror_options(), no_attempts).is_err());

        assert!(build(mirror_options(), index_options(links.path())).is_ok());
    }

    #[test]
    fn test_search_maps_content_ids_to_paths() {
        let links = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::write(root.join("a.txt"), "hello world").unwrap();
        std::fs::write(root.join("b.txt"), "hello there").unwrap();

        let facade = facade(&links);
        facade.watch(WatchTarget::directory(&root).unwrap());
        facade.run().unwrap();

        assert!(wait_until(|| facade.search_text("hello").file_names.len() == 2));
        assert_eq!(
            facade.search_text("world").file_names,
            vec![root.join("a.txt")]
        );
        facade.dispose().unwrap();
    }

    #[test]
    fn test_shared_content_id_survives_deleting_one_path() {
        let links = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("first.txt");
        let second = dir.path().join("second.txt");
        std::fs::write(&first, "shared needle").unwrap();
        std::fs::write(&second, "shared needle").unwrap();

        let facade = facade(&links);
        let shared = facade.shared.clone();
        let first_file = tracked_file(&facade, &first, 7);
        let second_file = tracked_file(&facade, &second, 7);
        shared.file_created(&first_file);
        shared.file_created(&second_file);

        facade.run().unwrap();
        assert!(wait_until(|| facade.search_text("needle").file_names.len() == 2));
        assert!(wait_until(|| facade.pending().is_empty()));

        facade.shared.tree.remove(first_file.id);
        shared.file_deleted(&first_file);
        assert_eq!(facade.pending().removing, 0);

        assert_eq!(facade.search_text("needle").file_names, vec![second.clone()]);
        facade.dispose().unwrap();
    }

    #[test]
    fn test_deleting_last_path_removes_content() {
        let links = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("only.txt");
        std::fs::write(&path, "lonely").unwrap();

        let facade = facade(&links);
        let shared = facade.shared.clone();
        let file = tracked_file(&facade, &path, 3);
        shared.file_created(&file);
        facade.run().unwrap();
        assert!(wait_until(|| facade.search_text("lonely").file_names.len() == 1));

        facade.shared.tree.remove(file.id);
        shared.file_deleted(&file);

        let engine = facade.engine().clone();
        let query = facade.query_builder().parse("lonely");
        assert!(wait_until(|| engine.search(&query).content_ids.is_empty()));
        facade.dispose().unwrap();
    }

    #[test]
    fn test_delete_before_throttle_elapsed_cancels_add() {
        let links = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("brief.txt");
        std::fs::write(&path, "ephemeral").unwrap();

        let facade = facade(&links);
        let shared = facade.shared.clone();
        let file = tracked_file(&facade, &path, 4);
        shared.file_created(&file);
        assert_eq!(facade.pending().delayed, 1);

        shared.file_deleted(&file);
        let pending = facade.pending();
        assert_eq!(pending.delayed, 0);
        assert_eq!(pending.removing, 1);
        facade.dispose().unwrap();
    }

    #[test]
    fn test_vanished_file_is_not_queued() {
        let links = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();

        let facade = facade(&links);
        let file = tracked_file(&facade, &dir.path().join("never-existed.txt"), 5);
        facade.shared.file_created(&file);

        assert!(facade.pending().is_empty());
        facade.dispose().unwrap();
    }

    #[test]
    fn test_move_of_unindexed_file_is_requeued() {
        let links = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let before = dir.path().join("before.txt");
        let after = dir.path().join("after.txt");
        std::fs::write(&before, "moving").unwrap();

        let facade = facade(&links);
        let shared = facade.shared.clone();
        let file = tracked_file(&facade, &before, 6);
        shared.file_created(&file);

        std::fs::rename(&before, &after).unwrap();
        shared.tree.move_entry(file.id, &after).unwrap();
        shared.file_moved(&file);

        let pending = facade.pending();
        assert_eq!(pending.delayed, 1);
        let (_, task) = shared.delayed.try_peek().unwrap();
        assert_eq!(task.path.as_deref(), Some(after.as_path()));
        facade.dispose().unwrap();
    }

    #[test]
    fn test_smallest_file_is_indexed_first() {
        let links = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let large = dir.path().join("large.txt");
        let small = dir.path().join("small.txt");
        std::fs::write(&large, "large ".repeat(100)).unwrap();
        std::fs::write(&small, "small").unwrap();

        let facade = facade(&links);
        let shared = facade.shared.clone();
        let large_file = tracked_file(&facade, &large, 1);
        let small_file = tracked_file(&facade, &small, 2);
        shared.file_created(&large_file);
        shared.file_created(&small_file);

        std::thread::sleep(Duration::from_millis(30));
        assert!(shared.promote_delayed());
        assert!(shared.promote_delayed());

        let (first, _) = shared.adding.try_remove_min().unwrap();
        assert_eq!(first, small_file);
        facade.dispose().unwrap();
    }

    #[test]
    fn test_syntax_errors_are_reported() {
        let links = TempDir::new().unwrap();
        let facade = facade(&links);

        let result = facade.search_text("\"unterminated");
        assert!(result.file_names.is_empty());
        assert_eq!(result.syntax_errors.len(), 1);
        facade.dispose().unwrap();
    }
}
