//! Reconciles filesystem notifications and directory scans against an [`EntryTree`].
//!
//! Every iteration of the mirror's background loop handles exactly one unit of work, taken
//! from the first non-empty source in this order:
//!
//! 1. a pending [`Change`] from the watcher
//! 2. a created entry (scan a directory, classify an unclassified entry, announce a file)
//! 3. a deleted entry (announce deletion of every file below it)
//! 4. a moved entry (announce moves, rescan a directory scanned moments before the move)
//! 5. inspection of the watch targets, followed by an idle period
//!
//! Files are announced to [`MirrorListener`]s; everything else is published as
//! [`MirrorEvent`]s for diagnostics.

use crate::background::{BackgroundLoop, Iteration, LoopContext, LoopError, LoopEvent};
use crate::collections::{lock, FifoSet};
use crate::fs::filter::FileNameFilter;
use crate::fs::model::{
    Change, ChangeType, ContentIdSequence, EntryAccessError, EntryKind, EntryType, FileEntry,
    Metadata, WatchTarget,
};
use crate::fs::tree::{EntryId, EntryTree};
use crate::fs::watcher::{Watcher, WatcherEvent};
use crate::utils::paths_equal;
use anyhow::{bail, Result};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

/// The mirrored tree: every node carries shared [`Metadata`].
pub type MirrorTree = EntryTree<Arc<Metadata>>;

#[derive(Debug, Clone)]
pub struct MirrorOptions {
    /// Back-off between iterations that found no work.
    pub idle_delay: Duration,
    /// How long after a move an entry's path is not yet trusted.
    pub allowable_path_synchronization_lag: Duration,
    /// Coalescing window for native notifications.
    pub debounce: Duration,
}

impl MirrorOptions {
    /// Reject delays the mirror cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.idle_delay.is_zero() {
            bail!("mirror idle delay must be positive");
        }
        if self.debounce.is_zero() {
            bail!("mirror debounce window must be positive");
        }
        Ok(())
    }
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            idle_delay: Duration::from_millis(100),
            allowable_path_synchronization_lag: Duration::from_millis(400),
            debounce: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WatchTargetState {
    /// Not subscribed: not yet inspected, or covered by an active ancestor directory target.
    Suspended,
    Active,
    /// The watched directory is missing or was moved away.
    Failed,
}

/// Diagnostic notifications published by the mirror.
#[derive(Debug, Clone)]
pub enum MirrorEvent {
    ProcessingChange(Change),
    EntryFound { entry_type: EntryType, path: PathBuf },
    EnqueuedCreated(EntryId),
    EnqueuedDeleted(EntryId),
    EnqueuedMoved(EntryId),
    ProcessingCreated(EntryId),
    ProcessingDeleted(EntryId),
    ProcessingMoved(EntryId),
    FileCreated(FileEntry),
    FileDeleted(FileEntry),
    FileMoved(FileEntry),
    ScanStarted { id: EntryId, path: PathBuf },
    ScanFinished { id: EntryId, path: PathBuf },
    ScanInterrupted { id: EntryId, path: PathBuf },
    ScanNotFound { id: EntryId, path: PathBuf },
    TargetStateChanged { target: WatchTarget, state: WatchTargetState },
    PathDrift { change: Change, message: String },
    AccessError(EntryAccessError),
}

/// Receives file lifecycle notifications. Called on the mirror's worker thread.
pub trait MirrorListener: Send + Sync {
    fn file_created(&self, file: &FileEntry);
    fn file_deleted(&self, file: &FileEntry);
    fn file_moved(&self, file: &FileEntry);
    fn access_error(&self, _error: &EntryAccessError) {}
}

struct TargetRegistry {
    locations: EntryTree<Vec<WatchTarget>>,
    states: FxHashMap<WatchTarget, WatchTargetState>,
}

impl TargetRegistry {
    fn has_watched_ancestor(&self, path: &Path, active_only: bool) -> bool {
        self.locations.find_ancestors(path).into_iter().any(|id| {
            self.locations.data(id).is_some_and(|targets| {
                targets.iter().any(|target| {
                    target.entry_type() == EntryType::Directory
                        && (!active_only
                            || self.states.get(target) == Some(&WatchTargetState::Active))
                })
            })
        })
    }
}

struct MirrorShared {
    tree: Arc<MirrorTree>,
    watcher: Watcher,
    sequence: Arc<ContentIdSequence>,
    filter: FileNameFilter,
    options: MirrorOptions,
    registry: Mutex<TargetRegistry>,
    changes: FifoSet<Change>,
    created: FifoSet<EntryId>,
    deleted: FifoSet<EntryId>,
    moved: FifoSet<EntryId>,
    listeners: RwLock<Vec<Arc<dyn MirrorListener>>>,
    events: broadcast::Sender<MirrorEvent>,
}

/// Keeps an in-memory replica of the watched files and directories.
pub struct Mirror {
    shared: Arc<MirrorShared>,
    receiver: Mutex<Option<Receiver<WatcherEvent>>>,
    background: BackgroundLoop,
}

impl Mirror {
    pub fn new(
        options: MirrorOptions,
        sequence: Arc<ContentIdSequence>,
        filter: FileNameFilter,
    ) -> Result<Self> {
        options.validate()?;
        let (sender, receiver) = mpsc::channel();
        let (events, _) = broadcast::channel(1024);
        let background = BackgroundLoop::new("mirror", options.idle_delay)?;

        let shared = Arc::new(MirrorShared {
            tree: Arc::new(EntryTree::new(|| Arc::new(Metadata::default()))),
            watcher: Watcher::new(options.debounce, sender),
            sequence,
            filter,
            options,
            registry: Mutex::new(TargetRegistry {
                locations: EntryTree::new(Vec::new),
                states: FxHashMap::default(),
            }),
            changes: FifoSet::new(),
            created: FifoSet::new(),
            deleted: FifoSet::new(),
            moved: FifoSet::new(),
            listeners: RwLock::new(Vec::new()),
            events,
        });

        Ok(Self {
            shared,
            receiver: Mutex::new(Some(receiver)),
            background,
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn MirrorListener>) {
        self.shared
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Register a watch target. Idempotent. The target is activated by the next inspection.
    pub fn watch(&self, target: WatchTarget) {
        {
            let mut registry = lock(&self.shared.registry);
            if registry.states.contains_key(&target) {
                return;
            }
            registry
                .states
                .insert(target.clone(), WatchTargetState::Suspended);

            match registry.locations.find(target.path()) {
                Some(location) => {
                    registry
                        .locations
                        .with_data_mut(location, |targets| targets.push(target.clone()));
                }
                None => {
                    if let Err(e) = registry.locations.add(
                        EntryKind::Directory,
                        target.path(),
                        vec![target.clone()],
                    ) {
                        warn!(target = %target, error = %e, "Failed to register watch target");
                        return;
                    }
                }
            }
        }

        info!(target = %target, "Registered watch target");
        self.background.wake();
    }

    pub fn target_state(&self, target: &WatchTarget) -> Option<WatchTargetState> {
        lock(&self.shared.registry).states.get(target).copied()
    }

    pub fn tree(&self) -> Arc<MirrorTree> {
        self.shared.tree.clone()
    }

    pub fn find(&self, path: &Path) -> Option<EntryId> {
        self.shared.tree.find(path)
    }

    pub fn watcher(&self) -> &Watcher {
        &self.shared.watcher
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MirrorEvent> {
        self.shared.events.subscribe()
    }

    pub fn subscribe_loop(&self) -> broadcast::Receiver<LoopEvent> {
        self.background.subscribe()
    }

    /// Render the mirrored tree with each file's content id.
    pub fn render(&self) -> String {
        let describe = |metadata: &Arc<Metadata>| metadata.to_string();
        self.shared.tree.render(None, Some(&describe))
    }

    /// Enable the watcher and start the background worker.
    pub fn run(&self) -> Result<(), LoopError> {
        if self.background.is_cancelled() {
            return Err(LoopError::Disposed(self.background.name().to_string()));
        }
        let Some(receiver) = lock(&self.receiver).take() else {
            return Err(LoopError::AlreadyStarted(self.background.name().to_string()));
        };

        // enabled before the first iteration so no change escapes the first scan
        self.shared.watcher.set_enabled(true);
        self.background.run(MirrorWorker {
            shared: self.shared.clone(),
            receiver,
        })
    }

    /// Disable the watcher, stop the worker and report its failure, if any.
    pub fn dispose(&self) -> Result<(), LoopError> {
        self.shared.watcher.set_enabled(false);
        self.background.dispose()
    }
}

struct MirrorWorker {
    shared: Arc<MirrorShared>,
    receiver: Receiver<WatcherEvent>,
}

impl MirrorWorker {
    fn drain_watcher_events(&self) {
        loop {
            match self.receiver.try_recv() {
                Ok(WatcherEvent::Change(change)) => {
                    trace!(change = %change, "Change detected");
                    self.shared.changes.try_enqueue(change);
                }
                Ok(WatcherEvent::Error { target, message }) => {
                    warn!(target = %target, error = %message, "Watch subscription failed");
                    let mut registry = lock(&self.shared.registry);
                    if registry.states.contains_key(&target) {
                        self.shared.suspend_failed_target(&mut registry, &target);
                    }
                }
                Err(_) => return,
            }
        }
    }
}

impl Iteration for MirrorWorker {
    fn iteration(&mut self, ctx: &LoopContext) -> anyhow::Result<()> {
        self.drain_watcher_events();
        let shared = &self.shared;

        if let Some(change) = shared.changes.try_dequeue() {
            shared.process_change(change);
            return Ok(());
        }

        if let Some(id) = shared.created.try_dequeue() {
            shared.process_created_entry(id, ctx.token());
            return Ok(());
        }

        if let Some(id) = shared.deleted.try_dequeue() {
            shared.process_deleted_entry(id);
            return Ok(());
        }

        if let Some(id) = shared.moved.try_dequeue() {
            shared.process_moved_entry(id, ctx.token());
            return Ok(());
        }

        shared.inspect_watch_targets();
        ctx.idle();
        Ok(())
    }
}

impl MirrorShared {
    fn publish(&self, event: MirrorEvent) {
        let _ = self.events.send(event);
    }

    fn listeners(&self) -> Vec<Arc<dyn MirrorListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn file_entry(&self, id: EntryId) -> Option<FileEntry> {
        self.tree.data(id).map(|metadata| FileEntry { id, metadata })
    }

    fn report_access_error(&self, error: EntryAccessError) {
        warn!(path = %error.path.display(), error = %error.message, "Access error");
        for listener in self.listeners() {
            listener.access_error(&error);
        }
        self.publish(MirrorEvent::AccessError(error));
    }

    // ---- changes ----

    fn process_change(&self, mut change: Change) {
        if let Some(source) = change.source {
            if !self.watcher.is_subscription_active(source) {
                trace!(change = %change, "Dropping change from a stopped subscription");
                return;
            }
        }

        if let Err(e) = self.watcher.assert_path_correct(&change) {
            // the target is failed by the next inspection
            warn!(change = %change, error = %e, "Dropping change with stale path");
            self.publish(MirrorEvent::PathDrift {
                change,
                message: e.to_string(),
            });
            return;
        }

        if change.entry_type == EntryType::Uncertain && change.change_type != ChangeType::Deleted {
            if let Some(entry_type) = EntryType::of_path(&change.path) {
                change.entry_type = entry_type;
            }
        }

        debug!(change = %change, "Processing change");
        self.publish(MirrorEvent::ProcessingChange(change.clone()));

        let is_watched = self.is_watched(change.entry_type, &change.path);
        match change.change_type {
            ChangeType::Created | ChangeType::Changed => {
                if is_watched {
                    self.process_changed_or_created(change.entry_type, &change.path);
                }
            }
            ChangeType::Deleted => {
                if is_watched {
                    self.process_deleted_path(&change.path);
                }
            }
            ChangeType::Renamed => {
                let was_watched = change
                    .old_path
                    .as_deref()
                    .is_some_and(|old_path| self.is_watched(change.entry_type, old_path));

                match (is_watched, was_watched, change.old_path.as_deref()) {
                    (true, true, Some(old_path)) => {
                        self.process_renamed(change.entry_type, &change.path, old_path)
                    }
                    (true, _, _) => self.process_changed_or_created(change.entry_type, &change.path),
                    (false, true, Some(old_path)) => self.process_deleted_path(old_path),
                    _ => {}
                }
            }
        }
    }

    fn is_watched(&self, entry_type: EntryType, path: &Path) -> bool {
        if entry_type == EntryType::File && !self.filter.matches(path) {
            return false;
        }

        let registry = lock(&self.registry);
        let targeted = registry
            .locations
            .find(path)
            .and_then(|location| registry.locations.data(location))
            .is_some_and(|targets| !targets.is_empty());

        targeted || registry.has_watched_ancestor(path, false)
    }

    fn process_changed_or_created(&self, entry_type: EntryType, path: &Path) {
        let Some(existing) = self.tree.find(path) else {
            self.create_entry(entry_type, path);
            return;
        };
        let Some(existing_kind) = self.tree.kind(existing) else {
            return;
        };

        let actual_kind = match entry_type {
            EntryType::Uncertain => existing_kind,
            known => known.to_kind(),
        };

        // a changed file gets a new content identity
        if actual_kind != existing_kind || actual_kind == EntryKind::File {
            self.delete_entry(existing);
            self.create_entry(entry_type, path);
        }
    }

    fn process_found_entry(&self, entry_type: EntryType, path: &Path) {
        let Some(existing) = self.tree.find(path) else {
            self.create_entry(entry_type, path);
            return;
        };

        if self.tree.kind(existing) != Some(entry_type.to_kind()) {
            self.delete_entry(existing);
            self.create_entry(entry_type, path);
            return;
        }

        if entry_type == EntryType::Directory && self.created.try_enqueue(existing) {
            self.publish(MirrorEvent::EnqueuedCreated(existing));
        }
    }

    fn process_deleted_path(&self, path: &Path) {
        if let Some(existing) = self.tree.find(path) {
            self.delete_entry(existing);
        }
    }

    fn process_renamed(&self, entry_type: EntryType, path: &Path, old_path: &Path) {
        let Some(existing) = self.tree.find(old_path) else {
            self.process_changed_or_created(entry_type, path);
            return;
        };

        // whatever occupied the destination was replaced, unless only the case changed
        if !paths_equal(path, old_path) {
            self.process_deleted_path(path);
        }

        let conflicting =
            entry_type != EntryType::Uncertain && self.tree.kind(existing) != Some(entry_type.to_kind());
        if conflicting {
            self.process_deleted_path(old_path);
            self.process_changed_or_created(entry_type, path);
            return;
        }

        match self.tree.move_entry(existing, path) {
            Ok(()) => {
                if self.moved.try_enqueue(existing) {
                    self.publish(MirrorEvent::EnqueuedMoved(existing));
                }
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to move entry"),
        }
    }

    fn create_entry(&self, entry_type: EntryType, path: &Path) {
        let content_id = match entry_type {
            EntryType::File => Some(self.sequence.next_id()),
            _ => None,
        };

        let metadata = Arc::new(Metadata::new(content_id));
        match self.tree.add(entry_type.to_kind(), path, metadata) {
            Ok(id) => {
                trace!(path = %path.display(), entry_type = %entry_type, "Entry created");
                if self.created.try_enqueue(id) {
                    self.publish(MirrorEvent::EnqueuedCreated(id));
                }
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to add entry"),
        }
    }

    fn delete_entry(&self, id: EntryId) {
        self.tree.remove(id);
        // an entry is never queued as created and deleted at the same time
        self.created.try_remove(&id);
        if self.deleted.try_enqueue(id) {
            self.publish(MirrorEvent::EnqueuedDeleted(id));
        }
    }

    fn entry_found(&self, entry_type: EntryType, path: &Path) {
        if entry_type == EntryType::File && !self.filter.matches(path) {
            return;
        }

        self.publish(MirrorEvent::EntryFound {
            entry_type,
            path: path.to_path_buf(),
        });
        self.process_found_entry(entry_type, path);
    }

    // ---- queued entries ----

    fn process_created_entry(&self, id: EntryId, token: &CancellationToken) {
        self.publish(MirrorEvent::ProcessingCreated(id));

        match self.tree.kind(id) {
            Some(EntryKind::File) => {
                if let Some(file) = self.file_entry(id) {
                    for listener in self.listeners() {
                        listener.file_created(&file);
                    }
                    self.publish(MirrorEvent::FileCreated(file));
                }
            }
            Some(EntryKind::Directory) => self.scan_directory(id, token),
            Some(EntryKind::Unclassified) => self.classify_entry(id),
            Some(EntryKind::Root) | None => {}
        }
    }

    fn process_deleted_entry(&self, id: EntryId) {
        self.publish(MirrorEvent::ProcessingDeleted(id));

        match self.tree.kind(id) {
            Some(EntryKind::File) => {
                if let Some(file) = self.file_entry(id) {
                    self.announce_deleted(&file);
                }
            }
            Some(EntryKind::Directory) => self.cascade_deleted(id),
            _ => {}
        }

        if !self.tree.is_attached(id) {
            self.tree.purge(id);
        }
    }

    fn announce_deleted(&self, file: &FileEntry) {
        for listener in self.listeners() {
            listener.file_deleted(file);
        }
        self.publish(MirrorEvent::FileDeleted(file.clone()));
    }

    fn cascade_deleted(&self, directory: EntryId) {
        let mut pending = vec![directory];
        while let Some(current) = pending.pop() {
            for (child, kind) in self.tree.children(current) {
                match kind {
                    EntryKind::File => {
                        if let Some(file) = self.file_entry(child) {
                            self.announce_deleted(&file);
                        }
                    }
                    EntryKind::Directory => pending.push(child),
                    _ => {}
                }
            }
        }
    }

    fn process_moved_entry(&self, id: EntryId, token: &CancellationToken) {
        self.publish(MirrorEvent::ProcessingMoved(id));

        match self.tree.kind(id) {
            Some(EntryKind::File) => {
                if let Some(file) = self.file_entry(id) {
                    self.announce_moved(&file);
                }
            }
            Some(EntryKind::Directory) => {
                self.cascade_moved(id);

                // a directory scanned moments ago may have been a different directory
                // that briefly occupied the previous location
                let recently_scanned = self.tree.data(id).is_some_and(|metadata| {
                    metadata.elapsed_since_scan_finished()
                        < self.options.allowable_path_synchronization_lag
                });
                if recently_scanned {
                    debug!(id = %id, "Rescanning recently scanned moved directory");
                    self.scan_directory(id, token);
                }
            }
            _ => {}
        }
    }

    fn announce_moved(&self, file: &FileEntry) {
        for listener in self.listeners() {
            listener.file_moved(file);
        }
        self.publish(MirrorEvent::FileMoved(file.clone()));
    }

    fn cascade_moved(&self, directory: EntryId) {
        let mut pending = vec![directory];
        while let Some(current) = pending.pop() {
            for (child, kind) in self.tree.children(current) {
                match kind {
                    EntryKind::File => {
                        if let Some(file) = self.file_entry(child) {
                            self.announce_moved(&file);
                        }
                    }
                    EntryKind::Directory => pending.push(child),
                    _ => {}
                }
            }
        }
    }

    fn classify_entry(&self, id: EntryId) {
        let Some(path) = self.tree.path(id) else {
            return;
        };

        match EntryType::of_path(&path) {
            Some(EntryType::File) if !self.filter.matches(&path) => self.delete_entry(id),
            Some(entry_type) => self.entry_found(entry_type, &path),
            None => {}
        }
    }

    // ---- scanning ----

    fn scan_directory(&self, id: EntryId, token: &CancellationToken) {
        let (Some(path), Some(metadata)) = (self.tree.path(id), self.tree.data(id)) else {
            return;
        };
        metadata.reset_scan();

        if let Err(e) = self.scan_directory_at(id, &path, &metadata, token) {
            metadata.reset_scan();
            if e.kind() == io::ErrorKind::NotFound {
                self.publish(MirrorEvent::ScanNotFound { id, path });
            } else {
                self.report_access_error(EntryAccessError::new(EntryType::Directory, &path, e));
            }
        }
    }

    fn scan_directory_at(
        &self,
        id: EntryId,
        path: &Path,
        metadata: &Metadata,
        token: &CancellationToken,
    ) -> io::Result<()> {
        if !path.is_dir() {
            self.publish(MirrorEvent::ScanNotFound {
                id,
                path: path.to_path_buf(),
            });
            return Ok(());
        }

        metadata.begin_scan();
        self.publish(MirrorEvent::ScanStarted {
            id,
            path: path.to_path_buf(),
        });
        debug!(path = %path.display(), "Scanning directory");

        let (files, directories) = list_directory(path)?;
        let interrupted = || token.is_cancelled() || !self.tree.is_attached(id);

        for file in files {
            if interrupted() {
                self.scan_interrupted(id, path, metadata);
                return Ok(());
            }
            self.entry_found(EntryType::File, &file);
        }

        if interrupted() {
            self.scan_interrupted(id, path, metadata);
            return Ok(());
        }

        if !path.is_dir() {
            metadata.reset_scan();
            self.publish(MirrorEvent::ScanNotFound {
                id,
                path: path.to_path_buf(),
            });
            return Ok(());
        }

        for directory in directories {
            if interrupted() {
                self.scan_interrupted(id, path, metadata);
                return Ok(());
            }
            self.entry_found(EntryType::Directory, &directory);
        }

        metadata.end_scan();
        self.publish(MirrorEvent::ScanFinished {
            id,
            path: path.to_path_buf(),
        });
        Ok(())
    }

    fn scan_interrupted(&self, id: EntryId, path: &Path, metadata: &Metadata) {
        metadata.reset_scan();
        debug!(path = %path.display(), "Directory scan interrupted");
        self.publish(MirrorEvent::ScanInterrupted {
            id,
            path: path.to_path_buf(),
        });
    }

    // ---- watch targets ----

    fn inspect_watch_targets(&self) {
        let targets: Vec<WatchTarget> = lock(&self.registry).states.keys().cloned().collect();

        for target in targets {
            let mut registry = lock(&self.registry);
            let Some(stored) = registry.states.get(&target).copied() else {
                continue;
            };

            let actual = self.actual_target_state(&registry, &target);
            if actual == stored {
                continue;
            }

            match actual {
                WatchTargetState::Active => self.activate_target(&mut registry, &target),
                WatchTargetState::Suspended => self.suspend_redundant_target(&mut registry, &target),
                WatchTargetState::Failed => self.suspend_failed_target(&mut registry, &target),
            }
        }
    }

    fn actual_target_state(&self, registry: &TargetRegistry, target: &WatchTarget) -> WatchTargetState {
        if registry.has_watched_ancestor(target.path(), true) {
            return WatchTargetState::Suspended;
        }

        if !self.watcher.is_path_correct(target) {
            return WatchTargetState::Failed;
        }

        if !target.watched_directory().is_dir() {
            return WatchTargetState::Failed;
        }

        WatchTargetState::Active
    }

    fn set_target_state(&self, registry: &mut TargetRegistry, target: &WatchTarget, state: WatchTargetState) {
        registry.states.insert(target.clone(), state);
        info!(target = %target, state = ?state, "Watch target state changed");
        self.publish(MirrorEvent::TargetStateChanged {
            target: target.clone(),
            state,
        });
    }

    fn activate_target(&self, registry: &mut TargetRegistry, target: &WatchTarget) {
        if let Err(e) = self.watcher.watch(target) {
            self.watcher.unwatch(target);
            if registry.states.get(target) != Some(&WatchTargetState::Failed) {
                self.set_target_state(registry, target, WatchTargetState::Failed);
            }
            self.report_access_error(EntryAccessError::new(
                EntryType::Directory,
                target.watched_directory(),
                format!("{:#}", e),
            ));
            return;
        }
        self.set_target_state(registry, target, WatchTargetState::Active);

        // after subscribing, so entries appearing during the scan are notified
        match target.entry_type() {
            EntryType::File => {
                if EntryType::of_path(target.path()) == Some(EntryType::File) {
                    self.entry_found(EntryType::File, target.path());
                }
            }
            _ => self.entry_found(EntryType::Directory, target.path()),
        }
    }

    fn suspend_failed_target(&self, registry: &mut TargetRegistry, target: &WatchTarget) {
        self.set_target_state(registry, target, WatchTargetState::Failed);
        self.watcher.unwatch(target);

        // what happened while unobserved is unknown, so assume the target is gone
        self.changes.try_enqueue(Change::new(
            target.entry_type(),
            ChangeType::Deleted,
            target.path(),
        ));
    }

    fn suspend_redundant_target(&self, registry: &mut TargetRegistry, target: &WatchTarget) {
        self.set_target_state(registry, target, WatchTargetState::Suspended);
        self.watcher.unwatch(target);
    }
}

/// Immediate children of `path`, split into files and directories. Symbolic links are
/// followed; unreadable children are skipped.
fn list_directory(path: &Path) -> io::Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut files = Vec::new();
    let mut directories = Vec::new();

    for entry in WalkDir::new(path)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
    {
        match entry {
            Ok(entry) => {
                let file_type = entry.file_type();
                if file_type.is_dir() {
                    directories.push(entry.into_path());
                } else if file_type.is_file() {
                    files.push(entry.into_path());
                }
            }
            Err(e) if e.depth() == 0 => {
                return Err(e
                    .into_io_error()
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "directory loop")));
            }
            Err(e) => debug!(error = %e, "Skipping unreadable directory entry"),
        }
    }

    Ok((files, directories))
}
