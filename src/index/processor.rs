//! Executes [`IndexingTask`]s against an [`IndexEngine`].
//!
//! File content is read through a temporary hard link when possible, so that other
//! processes can delete or replace the file while it is being read.

use crate::background::Cancelled;
use crate::collections::lock;
use crate::fs::model::{EntryAccessError, EntryType};
use crate::fs::platform::{create_hard_link, open_shared, open_temporary};
use crate::index::engine::IndexEngine;
use crate::index::task::{IndexingAction, IndexingTask};
use crate::utils::path_root;
use anyhow::{Context, Result};
use chardetng::EncodingDetector;
use encoding_rs::Encoding;
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Files at or above this length are removed from the index instead of indexed.
    pub max_file_length: u64,
    pub max_read_attempts: u32,
    /// Where temporary hard links are created. Defaults to a directory named
    /// `hardlink_directory_name` at the root of the file's volume.
    pub hardlink_directory: Option<PathBuf>,
    pub hardlink_directory_name: String,
    pub transcode_non_utf8: bool,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            max_file_length: 64 * 1024 * 1024,
            max_read_attempts: 3,
            hardlink_directory: None,
            hardlink_directory_name: ".live_index_links".to_string(),
            transcode_non_utf8: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct ProcessingOutcome {
    pub indexed: bool,
    pub removed: bool,
    /// A transient failure that should be retried with a repetition task.
    pub has_to_be_repeated: bool,
    /// A failure that will not be retried.
    pub access_error: Option<EntryAccessError>,
    /// A temporary hard link that could not be deleted.
    pub failed_hardlink: Option<PathBuf>,
}

pub struct IndexingTaskProcessor {
    engine: Arc<dyn IndexEngine>,
    options: ProcessorOptions,
    /// Link directory → whether it is usable
    link_directories: Mutex<FxHashMap<PathBuf, bool>>,
    created_directories: Mutex<Vec<PathBuf>>,
}

impl IndexingTaskProcessor {
    pub fn new(engine: Arc<dyn IndexEngine>, options: ProcessorOptions) -> Self {
        Self {
            engine,
            options,
            link_directories: Mutex::new(FxHashMap::default()),
            created_directories: Mutex::new(Vec::new()),
        }
    }

    pub fn options(&self) -> &ProcessorOptions {
        &self.options
    }

    /// Process `task`. Only engine failures are returned as errors; cancellation is not one.
    pub fn process(&self, task: &IndexingTask) -> Result<ProcessingOutcome> {
        match task.action {
            IndexingAction::RemoveContent => {
                self.remove(task)?;
                Ok(ProcessingOutcome {
                    removed: true,
                    ..ProcessingOutcome::default()
                })
            }
            IndexingAction::AddContent => self.add(task),
        }
    }

    fn remove(&self, task: &IndexingTask) -> Result<()> {
        match self.engine.remove(task.content_id, task.token()) {
            Err(e) if e.downcast_ref::<Cancelled>().is_none() => {
                Err(e).with_context(|| format!("Failed to remove content {}", task.content_id))
            }
            _ => Ok(()),
        }
    }

    fn add(&self, task: &IndexingTask) -> Result<ProcessingOutcome> {
        let mut outcome = ProcessingOutcome::default();
        let Some(path) = task.path.as_deref() else {
            return Ok(outcome);
        };

        if task.length.unwrap_or_default() >= self.options.max_file_length {
            debug!(path = %path.display(), length = ?task.length, "File too large, removing from index");
            self.remove(task)?;
            outcome.removed = true;
            return Ok(outcome);
        }

        let bytes = match self.read(path, &mut outcome) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!(path = %path.display(), "File vanished before it was read");
                return Ok(outcome);
            }
            Err(e) => {
                if task.attempts + 1 < self.options.max_read_attempts {
                    debug!(path = %path.display(), attempt = task.attempts + 1, error = %e, "Read failed, will retry");
                    outcome.has_to_be_repeated = true;
                } else {
                    warn!(path = %path.display(), error = %e, "Giving up reading file");
                    outcome.access_error = Some(EntryAccessError::new(EntryType::File, path, e));
                }
                return Ok(outcome);
            }
        };

        if task.is_cancelled() {
            return Ok(outcome);
        }

        // the file may have grown since its length was resolved
        if bytes.len() as u64 >= self.options.max_file_length {
            debug!(path = %path.display(), read = bytes.len(), "File grew too large, removing from index");
            self.remove(task)?;
            outcome.removed = true;
            return Ok(outcome);
        }

        let Some(text) = decode_text(bytes, self.options.transcode_non_utf8) else {
            debug!(path = %path.display(), "File is not valid UTF-8, removing from index");
            self.remove(task)?;
            outcome.removed = true;
            return Ok(outcome);
        };

        match self.engine.update(task.content_id, &text, task.token()) {
            Ok(()) => {
                if !task.is_cancelled() {
                    if let Some(file) = &task.file {
                        file.metadata.mark_indexed();
                    }
                    outcome.indexed = true;
                }
                Ok(outcome)
            }
            Err(e) if e.downcast_ref::<Cancelled>().is_some() => Ok(outcome),
            Err(e) => Err(e).with_context(|| format!("Failed to index {}", path.display())),
        }
    }

    fn read(&self, path: &Path, outcome: &mut ProcessingOutcome) -> io::Result<Vec<u8>> {
        let file = match self.open_through_link(path, outcome) {
            Some(file) => file,
            None => open_shared(path)?,
        };

        // reading up to the limit is enough to tell an oversize file apart
        let mut bytes = Vec::new();
        file.take(self.options.max_file_length)
            .read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    fn open_through_link(&self, path: &Path, outcome: &mut ProcessingOutcome) -> Option<File> {
        let directory = self.link_directory(path)?;
        let link = directory.join(format!("{:016x}", rand::random::<u64>()));

        if let Err(e) = create_hard_link(path, &link) {
            trace!(path = %path.display(), error = %e, "Hard link not available");
            return None;
        }

        match open_temporary(&link) {
            Ok(file) => Some(file),
            Err(e) => {
                debug!(link = %link.display(), error = %e, "Failed to open temporary hard link");
                if link.exists() && std::fs::remove_file(&link).is_err() {
                    outcome.failed_hardlink = Some(link);
                }
                None
            }
        }
    }

    fn link_directory(&self, path: &Path) -> Option<PathBuf> {
        let directory = match &self.options.hardlink_directory {
            Some(directory) => directory.clone(),
            None => path_root(path)?.join(&self.options.hardlink_directory_name),
        };

        let mut known = lock(&self.link_directories);
        if let Some(usable) = known.get(&directory) {
            return usable.then(|| directory.clone());
        }

        let existed = directory.is_dir();
        let usable = existed
            || match std::fs::create_dir_all(&directory) {
                Ok(()) => {
                    debug!(directory = %directory.display(), "Created hard link directory");
                    lock(&self.created_directories).push(directory.clone());
                    true
                }
                Err(e) => {
                    debug!(directory = %directory.display(), error = %e, "Hard link directory unavailable");
                    false
                }
            };

        known.insert(directory.clone(), usable);
        usable.then_some(directory)
    }

    /// Delete the hard link directories this processor created.
    pub fn dispose(&self) {
        lock(&self.link_directories).clear();
        for directory in lock(&self.created_directories).drain(..) {
            if let Err(e) = std::fs::remove_dir_all(&directory) {
                warn!(directory = %directory.display(), error = %e, "Failed to remove hard link directory");
            }
        }
    }
}

/// Decode file content.
///
/// A byte order mark decides the encoding; otherwise valid UTF-8 is taken as is. Anything
/// else is decoded with a guessed encoding if `transcode` is set, and rejected if not.
pub fn decode_text(bytes: Vec<u8>, transcode: bool) -> Option<String> {
    if let Some((encoding, bom_length)) = Encoding::for_bom(&bytes) {
        let (text, _) = encoding.decode_without_bom_handling(&bytes[bom_length..]);
        return Some(text.into_owned());
    }

    let bytes = match String::from_utf8(bytes) {
        Ok(text) => return Some(text),
        Err(e) => e.into_bytes(),
    };
    if !transcode {
        return None;
    }

    let mut detector = EncodingDetector::new();
    detector.feed(&bytes, true);
    let encoding = detector.guess(None, true);
    let (text, _) = encoding.decode_without_bom_handling(&bytes);
    Some(text.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mirror::MirrorTree;
    use crate::fs::model::{ContentId, EntryKind, FileEntry, Metadata};
    use crate::fs::tree::EntryTree;
    use crate::index::memory::MemoryIndexEngine;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        dir: TempDir,
        tree: MirrorTree,
        engine: Arc<MemoryIndexEngine>,
        processor: IndexingTaskProcessor,
    }

    fn fixture(configure: impl FnOnce(&mut ProcessorOptions)) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut options = ProcessorOptions {
            hardlink_directory: Some(dir.path().join("links")),
            ..ProcessorOptions::default()
        };
        configure(&mut options);

        let engine = Arc::new(MemoryIndexEngine::new());
        let processor = IndexingTaskProcessor::new(engine.clone(), options);
        Fixture {
            dir,
            tree: EntryTree::new(|| Arc::new(Metadata::default())),
            engine,
            processor,
        }
    }

    impl Fixture {
        fn task(&self, name: &str, content: &[u8], id: u64) -> IndexingTask {
            let path = self.dir.path().join(name);
            std::fs::write(&path, content).unwrap();
            let metadata = Arc::new(Metadata::new(Some(ContentId(id))));
            let entry = self.tree.add(EntryKind::File, &path, metadata.clone()).unwrap();
            let file = FileEntry {
                id: entry,
                metadata,
            };
            let mut task = IndexingTask::add(file, &CancellationToken::new()).unwrap();
            assert!(task.resolve(&self.tree));
            task
        }

        fn hits(&self, text: &str) -> usize {
            let query = self.engine.query_builder().parse(text);
            self.engine.search(&query).content_ids.len()
        }
    }

    #[test]
    fn test_indexes_content_through_hard_link() {
        let fixture = fixture(|_| {});
        let task = fixture.task("a.txt", b"hello world", 1);

        let outcome = fixture.processor.process(&task).unwrap();

        assert!(outcome.indexed);
        assert!(outcome.failed_hardlink.is_none());
        assert_eq!(fixture.hits("hello"), 1);
        assert!(task.file.as_ref().unwrap().metadata.indexed_at().is_some());

        let links = fixture.dir.path().join("links");
        assert!(links.is_dir());
        assert_eq!(std::fs::read_dir(&links).unwrap().count(), 0);
    }

    #[test]
    fn test_dispose_removes_created_link_directory() {
        let fixture = fixture(|_| {});
        let task = fixture.task("a.txt", b"content", 1);
        fixture.processor.process(&task).unwrap();

        fixture.processor.dispose();
        assert!(!fixture.dir.path().join("links").exists());
    }

    #[test]
    fn test_falls_back_to_direct_read() {
        let fixture = fixture(|options| {
            options.hardlink_directory = Some(PathBuf::from("/dev/null/not-a-directory"));
        });
        let task = fixture.task("a.txt", b"fallback works", 1);

        let outcome = fixture.processor.process(&task).unwrap();
        assert!(outcome.indexed);
        assert_eq!(fixture.hits("fallback"), 1);
    }

    #[test]
    fn test_oversized_file_is_removed() {
        let fixture = fixture(|options| options.max_file_length = 4);
        let task = fixture.task("small.txt", b"tiny", 1);
        fixture
            .engine
            .update(ContentId(1), "stale", &CancellationToken::new())
            .unwrap();

        let outcome = fixture.processor.process(&task).unwrap();

        assert!(outcome.removed);
        assert!(!outcome.indexed);
        assert!(!fixture.engine.contains(ContentId(1)));
    }

    #[test]
    fn test_file_grown_past_limit_after_resolve_is_removed() {
        let fixture = fixture(|options| options.max_file_length = 16);
        let task = fixture.task("growing.txt", b"alpha", 1);
        assert_eq!(task.length, Some(5));
        std::fs::write(
            task.path.as_ref().unwrap(),
            "alpha bravo charlie delta echo",
        )
        .unwrap();

        let outcome = fixture.processor.process(&task).unwrap();

        assert!(outcome.removed);
        assert!(!outcome.indexed);
        assert!(!fixture.engine.contains(ContentId(1)));
        assert_eq!(fixture.hits("alpha"), 0);
        assert_eq!(fixture.hits("bravo"), 0);
    }

    #[test]
    fn test_file_just_below_limit_is_indexed() {
        let fixture = fixture(|options| options.max_file_length = 6);
        let task = fixture.task("fits.txt", b"alpha", 1);

        let outcome = fixture.processor.process(&task).unwrap();

        assert!(outcome.indexed);
        assert_eq!(fixture.hits("alpha"), 1);
    }

    #[test]
    fn test_vanished_file_is_not_retried() {
        let fixture = fixture(|_| {});
        let task = fixture.task("gone.txt", b"soon gone", 1);
        std::fs::remove_file(task.path.as_ref().unwrap()).unwrap();

        let outcome = fixture.processor.process(&task).unwrap();

        assert!(!outcome.indexed);
        assert!(!outcome.has_to_be_repeated);
        assert!(outcome.access_error.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_read_failure_is_retried_then_reported() {
        let fixture = fixture(|options| options.max_read_attempts = 2);
        let mut task = fixture.task("placeholder.txt", b"", 1);
        let directory = fixture.dir.path().join("a-directory");
        std::fs::create_dir(&directory).unwrap();
        task.path = Some(directory);

        let first = fixture.processor.process(&task).unwrap();
        assert!(first.has_to_be_repeated);
        assert!(first.access_error.is_none());

        let mut repeated = task.create_repetition_task(&CancellationToken::new());
        repeated.path = task.path.clone();
        repeated.length = Some(0);
        assert_eq!(repeated.attempts, 1);
        let second = fixture.processor.process(&repeated).unwrap();
        assert!(!second.has_to_be_repeated);
        assert!(second.access_error.is_some());
    }

    #[test]
    fn test_remove_task() {
        let fixture = fixture(|_| {});
        fixture
            .engine
            .update(ContentId(9), "doomed", &CancellationToken::new())
            .unwrap();

        let task = IndexingTask::remove(ContentId(9), &CancellationToken::new());
        let outcome = fixture.processor.process(&task).unwrap();

        assert!(outcome.removed);
        assert_eq!(fixture.hits("doomed"), 0);
    }

    #[test]
    fn test_cancelled_task_is_not_marked_indexed() {
        let fixture = fixture(|_| {});
        let task = fixture.task("a.txt", b"never indexed", 1);
        task.cancel();

        let outcome = fixture.processor.process(&task).unwrap();
        assert!(!outcome.indexed);
        assert!(task.file.as_ref().unwrap().metadata.indexed_at().is_none());
        assert_eq!(fixture.hits("never"), 0);
    }

    #[test]
    fn test_non_utf8_without_transcoding_is_removed() {
        let fixture = fixture(|options| options.transcode_non_utf8 = false);
        let task = fixture.task("latin1.txt", &[0x63, 0x61, 0x66, 0xE9], 1);

        let outcome = fixture.processor.process(&task).unwrap();
        assert!(outcome.removed);
        assert!(!outcome.indexed);
    }

    #[test]
    fn test_decode_text() {
        assert_eq!(decode_text(b"plain".to_vec(), false).as_deref(), Some("plain"));
        assert_eq!(
            decode_text(vec![0xEF, 0xBB, 0xBF, b'b', b'o', b'm'], false).as_deref(),
            Some("bom")
        );
        assert_eq!(
            decode_text(vec![0xFF, 0xFE, b'h', 0, b'i', 0], false).as_deref(),
            Some("hi")
        );
        assert_eq!(decode_text(vec![0x63, 0x61, 0x66, 0xE9], false), None);
        assert!(decode_text(vec![0x63, 0x61, 0x66, 0xE9], true).is_some());
    }

    #[test]
    fn test_decode_shift_jis() {
        let text = "日本語のテストです。これは日本語のテキストです。";
        let (encoded, _, _) = encoding_rs::SHIFT_JIS.encode(text);
        assert_eq!(decode_text(encoded.into_owned(), true).as_deref(), Some(text));
    }
}
