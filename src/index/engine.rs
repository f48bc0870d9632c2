//! Contract between the index facade and a full-text index engine.

use crate::fs::model::ContentId;
use crate::index::query::{Query, QueryBuilder};
use anyhow::Result;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A full-text index over content ids.
///
/// Implementations must allow `search` to run concurrently with one writer; the index facade
/// never issues more than one `update` or `remove` at a time.
pub trait IndexEngine: Send + Sync {
    fn initialize(&self) -> Result<()>;

    /// Replace the indexed text of `content_id`.
    ///
    /// Returns [`Cancelled`](crate::background::Cancelled) if `cancel` fires first, in which
    /// case the previous content stays indexed.
    fn update(&self, content_id: ContentId, text: &str, cancel: &CancellationToken) -> Result<()>;

    fn remove(&self, content_id: ContentId, cancel: &CancellationToken) -> Result<()>;

    fn search(&self, query: &Query) -> ContentSearchResult;

    fn query_builder(&self) -> Arc<dyn QueryBuilder>;

    fn stats(&self) -> EngineStats;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContentSearchResult {
    pub content_ids: Vec<ContentId>,
    pub syntax_errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ContentSearchResult {
    pub fn syntax_errors(errors: Vec<String>) -> Self {
        Self {
            syntax_errors: errors,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileSearchResult {
    pub file_names: Vec<PathBuf>,
    pub syntax_errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub documents: u64,
    pub terms: usize,
    pub postings: u64,
}
