//! Value types shared by the entry tree, the watcher and the mirror.

use crate::fs::tree::EntryId;
use crate::utils::{normalize_path_for_comparison, split_path};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Kind of a node stored in an [`EntryTree`](crate::fs::tree::EntryTree).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    Root,
    Directory,
    File,
    /// Detected by a notification but not yet classified as file or directory.
    Unclassified,
}

/// Entry type as reported by a change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    File,
    Directory,
    /// The notification source could not tell files from directories.
    Uncertain,
}

impl EntryType {
    pub fn to_kind(self) -> EntryKind {
        match self {
            EntryType::File => EntryKind::File,
            EntryType::Directory => EntryKind::Directory,
            EntryType::Uncertain => EntryKind::Unclassified,
        }
    }

    /// Classify a path against the live filesystem. Symbolic links are followed.
    pub fn of_path(path: &Path) -> Option<EntryType> {
        let metadata = std::fs::metadata(path).ok()?;
        if metadata.is_file() {
            Some(EntryType::File)
        } else if metadata.is_dir() {
            Some(EntryType::Directory)
        } else {
            None
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryType::File => write!(f, "File"),
            EntryType::Directory => write!(f, "Directory"),
            EntryType::Uncertain => write!(f, "Uncertain"),
        }
    }
}

/// Stable identity of one logical piece of indexed content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentId(pub u64);

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Mints content ids. One sequence is shared by everything that must not collide.
#[derive(Debug)]
pub struct ContentIdSequence {
    last: AtomicU64,
}

impl ContentIdSequence {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> ContentId {
        ContentId(self.last.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

impl Default for ContentIdSequence {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct MetadataState {
    length: Option<u64>,
    scan_started: Option<Instant>,
    scan_finished: Option<Instant>,
    indexed_at: Option<Instant>,
}

/// Payload of every mirrored file and directory.
///
/// Files carry a content id; directories carry scan timestamps. Both are shared between the
/// mirror worker and the index facade, hence the interior mutability.
#[derive(Debug, Default)]
pub struct Metadata {
    content_id: Option<ContentId>,
    state: Mutex<MetadataState>,
}

impl Metadata {
    pub fn new(content_id: Option<ContentId>) -> Self {
        Self {
            content_id,
            state: Mutex::default(),
        }
    }

    pub fn content_id(&self) -> Option<ContentId> {
        self.content_id
    }

    pub fn length(&self) -> Option<u64> {
        self.lock().length
    }

    pub fn set_length(&self, length: u64) {
        self.lock().length = Some(length);
    }

    pub fn begin_scan(&self) {
        let mut state = self.lock();
        state.scan_started = Some(Instant::now());
        state.scan_finished = None;
    }

    pub fn end_scan(&self) {
        self.lock().scan_finished = Some(Instant::now());
    }

    pub fn reset_scan(&self) {
        let mut state = self.lock();
        state.scan_started = None;
        state.scan_finished = None;
    }

    pub fn scan_started(&self) -> Option<Instant> {
        self.lock().scan_started
    }

    /// Time since the last completed scan; `Duration::MAX` if no scan has completed.
    pub fn elapsed_since_scan_finished(&self) -> Duration {
        self.lock()
            .scan_finished
            .map(|finished| finished.elapsed())
            .unwrap_or(Duration::MAX)
    }

    pub fn mark_indexed(&self) {
        self.lock().indexed_at = Some(Instant::now());
    }

    pub fn indexed_at(&self) -> Option<Instant> {
        self.lock().indexed_at
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetadataState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.content_id {
            Some(id) => write!(f, "{}", id),
            None => write!(f, "#-"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WatchTargetError {
    #[error("watch target path must be non empty")]
    Empty,
    #[error("watch target path must be absolute: {0}")]
    NotAbsolute(PathBuf),
    #[error("file watch target points at a filesystem root: {0}")]
    FileAtRoot(PathBuf),
    #[error("cannot watch an entry of type {0}")]
    InvalidType(EntryType),
}

/// A file or directory registered for observation.
///
/// Equality ignores the case of the path.
#[derive(Debug, Clone, Serialize)]
pub struct WatchTarget {
    entry_type: EntryType,
    path: PathBuf,
}

impl WatchTarget {
    pub fn new(entry_type: EntryType, path: impl Into<PathBuf>) -> Result<Self, WatchTargetError> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(WatchTargetError::Empty);
        }
        if !path.is_absolute() {
            return Err(WatchTargetError::NotAbsolute(path));
        }

        match entry_type {
            EntryType::Directory => {}
            EntryType::File => {
                if split_path(&path).map_or(true, |segments| segments.len() < 2) {
                    return Err(WatchTargetError::FileAtRoot(path));
                }
            }
            EntryType::Uncertain => return Err(WatchTargetError::InvalidType(entry_type)),
        }

        Ok(Self { entry_type, path })
    }

    pub fn directory(path: impl Into<PathBuf>) -> Result<Self, WatchTargetError> {
        Self::new(EntryType::Directory, path)
    }

    pub fn file(path: impl Into<PathBuf>) -> Result<Self, WatchTargetError> {
        Self::new(EntryType::File, path)
    }

    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The directory a native subscription is bound to: the target itself for directories,
    /// the parent for files.
    pub fn watched_directory(&self) -> &Path {
        match self.entry_type {
            EntryType::File => self.path.parent().unwrap_or(&self.path),
            _ => &self.path,
        }
    }

    fn comparison_key(&self) -> String {
        normalize_path_for_comparison(&self.path.to_string_lossy())
    }
}

impl PartialEq for WatchTarget {
    fn eq(&self, other: &Self) -> bool {
        self.entry_type == other.entry_type && self.comparison_key() == other.comparison_key()
    }
}

impl Eq for WatchTarget {}

impl Hash for WatchTarget {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entry_type.hash(state);
        self.comparison_key().hash(state);
    }
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.entry_type, self.path.display())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    Created,
    Deleted,
    Changed,
    Renamed,
}

/// Identifies the native subscription a change was delivered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SubscriptionId(pub u64);

/// One normalized filesystem notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Change {
    pub entry_type: EntryType,
    pub change_type: ChangeType,
    pub path: PathBuf,
    pub old_path: Option<PathBuf>,
    /// `None` for changes synthesized by the mirror itself.
    pub source: Option<SubscriptionId>,
}

impl Change {
    pub fn new(entry_type: EntryType, change_type: ChangeType, path: impl Into<PathBuf>) -> Self {
        Self {
            entry_type,
            change_type,
            path: path.into(),
            old_path: None,
            source: None,
        }
    }

    pub fn renamed(
        entry_type: EntryType,
        old_path: impl Into<PathBuf>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            entry_type,
            change_type: ChangeType::Renamed,
            path: path.into(),
            old_path: Some(old_path.into()),
            source: None,
        }
    }

    pub fn with_source(mut self, source: SubscriptionId) -> Self {
        self.source = Some(source);
        self
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.old_path {
            Some(old_path) => write!(
                f,
                "{} {:?}: {} -> {}",
                self.entry_type,
                self.change_type,
                old_path.display(),
                self.path.display()
            ),
            None => write!(
                f,
                "{} {:?}: {}",
                self.entry_type,
                self.change_type,
                self.path.display()
            ),
        }
    }
}

/// A failure to read a file or enumerate a directory. Recoverable; only reported.
#[derive(Debug, Clone, Serialize)]
pub struct EntryAccessError {
    pub entry_type: EntryType,
    pub path: PathBuf,
    pub message: String,
}

impl EntryAccessError {
    pub fn new(entry_type: EntryType, path: impl Into<PathBuf>, error: impl fmt::Display) -> Self {
        Self {
            entry_type,
            path: path.into(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for EntryAccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Error accessing {} {}: {}",
            self.entry_type,
            self.path.display(),
            self.message
        )
    }
}

/// A mirrored file as handed to listeners: the tree node plus its shared metadata.
///
/// Identity is the tree node, so a moved file stays equal to itself.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub id: EntryId,
    pub metadata: Arc<Metadata>,
}

impl FileEntry {
    pub fn content_id(&self) -> Option<ContentId> {
        self.metadata.content_id()
    }
}

impl PartialEq for FileEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for FileEntry {}

impl Hash for FileEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_content_id_sequence_is_monotonic() {
        let sequence = ContentIdSequence::new();
        let first = sequence.next_id();
        let second = sequence.next_id();
        assert!(second > first);
        assert_eq!(second, ContentId(2));
    }

    #[test]
    fn test_watch_target_rejects_relative_path() {
        assert_eq!(
            WatchTarget::directory("relative/dir"),
            Err(WatchTargetError::NotAbsolute(PathBuf::from("relative/dir")))
        );
        assert_eq!(WatchTarget::directory(""), Err(WatchTargetError::Empty));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_target_at_root_is_rejected() {
        assert!(matches!(
            WatchTarget::file("/"),
            Err(WatchTargetError::FileAtRoot(_))
        ));
        assert!(WatchTarget::file("/etc/hosts").is_ok());
    }

    #[test]
    fn test_watch_target_rejects_uncertain_type() {
        let path = std::env::temp_dir();
        assert_eq!(
            WatchTarget::new(EntryType::Uncertain, &path),
            Err(WatchTargetError::InvalidType(EntryType::Uncertain))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_watch_target_equality_ignores_case() {
        let lower = WatchTarget::directory("/data/project").unwrap();
        let upper = WatchTarget::directory("/Data/Project").unwrap();
        let as_file = WatchTarget::file("/data/project").unwrap();

        assert_eq!(lower, upper);
        assert_ne!(lower, as_file);

        let set: HashSet<_> = [lower, upper, as_file].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_watched_directory_of_file_target() {
        let target = WatchTarget::file("/data/notes.txt").unwrap();
        assert_eq!(target.watched_directory(), Path::new("/data"));
    }

    #[test]
    fn test_scan_timestamps() {
        let metadata = Metadata::new(None);
        assert_eq!(metadata.elapsed_since_scan_finished(), Duration::MAX);

        metadata.begin_scan();
        assert!(metadata.scan_started().is_some());
        assert_eq!(metadata.elapsed_since_scan_finished(), Duration::MAX);

        metadata.end_scan();
        assert!(metadata.elapsed_since_scan_finished() < Duration::from_secs(60));

        metadata.reset_scan();
        assert!(metadata.scan_started().is_none());
    }

    #[test]
    fn test_change_display() {
        let change = Change::renamed(EntryType::File, "/a/old.txt", "/a/new.txt");
        assert!(change.to_string().contains("Renamed"));
        assert!(change.to_string().contains("->"));
    }
}
