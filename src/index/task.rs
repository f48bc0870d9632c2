//! Units of work queued by the index facade.

use crate::fs::model::{ContentId, FileEntry};
use crate::fs::mirror::MirrorTree;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IndexingAction {
    AddContent,
    RemoveContent,
}

impl fmt::Display for IndexingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexingAction::AddContent => write!(f, "add"),
            IndexingAction::RemoveContent => write!(f, "remove"),
        }
    }
}

/// One unit of work for the index engine.
///
/// The task's token is a child of the owning loop's token, so it fires on shutdown as well
/// as when the task is cancelled because its file was deleted or moved.
#[derive(Debug, Clone)]
pub struct IndexingTask {
    pub action: IndexingAction,
    pub content_id: ContentId,
    pub file: Option<FileEntry>,
    /// Resolved when the task is delayed; `None` until then.
    pub path: Option<PathBuf>,
    pub length: Option<u64>,
    pub created: Instant,
    pub attempts: u32,
    token: CancellationToken,
}

impl IndexingTask {
    /// Index the content of `file`. `None` for entries without a content id.
    pub fn add(file: FileEntry, parent: &CancellationToken) -> Option<Self> {
        let content_id = file.content_id()?;
        Some(Self {
            action: IndexingAction::AddContent,
            content_id,
            file: Some(file),
            path: None,
            length: None,
            created: Instant::now(),
            attempts: 0,
            token: parent.child_token(),
        })
    }

    pub fn remove(content_id: ContentId, parent: &CancellationToken) -> Self {
        Self {
            action: IndexingAction::RemoveContent,
            content_id,
            file: None,
            path: None,
            length: None,
            created: Instant::now(),
            attempts: 0,
            token: parent.child_token(),
        }
    }

    /// Look up the file's current path and length. `false` if it no longer exists.
    pub fn resolve(&mut self, tree: &MirrorTree) -> bool {
        let Some(file) = &self.file else {
            return false;
        };
        let Some(path) = tree.path(file.id) else {
            return false;
        };
        let Ok(metadata) = std::fs::metadata(&path) else {
            return false;
        };
        if !metadata.is_file() {
            return false;
        }

        file.metadata.set_length(metadata.len());
        self.length = Some(metadata.len());
        self.path = Some(path);
        true
    }

    /// A fresh attempt at the same work, with its own token.
    pub fn create_repetition_task(&self, parent: &CancellationToken) -> Self {
        Self {
            action: self.action,
            content_id: self.content_id,
            file: self.file.clone(),
            path: None,
            length: None,
            created: Instant::now(),
            attempts: self.attempts + 1,
            token: parent.child_token(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl fmt::Display for IndexingTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action, self.content_id)?;
        if let Some(path) = &self.path {
            write!(f, " ({})", path.display())?;
        }
        Ok(())
    }
}
