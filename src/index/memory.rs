//! In-memory inverted index.
//!
//! Every analysed word maps to the set of content ids containing it, stored as a roaring
//! bitmap. Word positions are kept per document to verify phrases after the bitmap
//! intersection narrowed the candidates down.

use crate::background::Cancelled;
use crate::fs::model::ContentId;
use crate::index::engine::{ContentSearchResult, EngineStats, IndexEngine};
use crate::index::query::{analyze, BoolOperator, Query, QueryBuilder, QueryNode, StandardQueryBuilder};
use anyhow::Result;
use regex::Regex;
use roaring::RoaringTreemap;
use rustc_hash::FxHashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Words analysed between two cancellation checks.
const CANCELLATION_CHECK_INTERVAL: usize = 1024;

#[derive(Debug, Default)]
struct Document {
    /// Ascending word positions per word
    positions: FxHashMap<String, Vec<u32>>,
}

#[derive(Debug, Default)]
struct InvertedIndex {
    postings: FxHashMap<String, RoaringTreemap>,
    documents: FxHashMap<u64, Document>,
    all: RoaringTreemap,
}

impl InvertedIndex {
    fn add_document(&mut self, id: u64, document: Document) {
        for word in document.positions.keys() {
            self.postings.entry(word.clone()).or_default().insert(id);
        }
        self.all.insert(id);
        self.documents.insert(id, document);
    }

    fn remove_document(&mut self, id: u64) -> bool {
        let Some(document) = self.documents.remove(&id) else {
            return false;
        };

        for word in document.positions.keys() {
            let now_empty = match self.postings.get_mut(word) {
                Some(ids) => {
                    ids.remove(id);
                    ids.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.postings.remove(word);
            }
        }
        self.all.remove(id);
        true
    }

    fn evaluate(&self, node: &QueryNode) -> RoaringTreemap {
        match node {
            QueryNode::MatchAll => self.all.clone(),
            QueryNode::Term(word) => self.postings.get(word).cloned().unwrap_or_default(),
            QueryNode::Phrase(words) => self.phrase(words),
            QueryNode::Prefix(prefix) => self.matching_words(|word| word.starts_with(prefix.as_str())),
            QueryNode::Wildcard(pattern) => match wildcard_regex(pattern) {
                Ok(regex) => self.matching_words(|word| regex.is_match(word)),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "Invalid wildcard pattern");
                    RoaringTreemap::new()
                }
            },
            QueryNode::Bool(clauses) => self.boolean(clauses),
        }
    }

    fn boolean(&self, clauses: &[(BoolOperator, QueryNode)]) -> RoaringTreemap {
        let mut required: Option<RoaringTreemap> = None;
        let mut optional: Option<RoaringTreemap> = None;
        let mut prohibited = RoaringTreemap::new();

        for (operator, node) in clauses {
            let ids = self.evaluate(node);
            match operator {
                BoolOperator::Must => {
                    required = Some(match required {
                        Some(current) => current & ids,
                        None => ids,
                    });
                }
                BoolOperator::Should => {
                    optional = Some(match optional {
                        Some(current) => current | ids,
                        None => ids,
                    });
                }
                BoolOperator::MustNot => prohibited |= ids,
            }
        }

        // optional clauses only narrow the result when nothing is required
        let mut result = match (required, optional) {
            (Some(required), _) => required,
            (None, Some(optional)) => optional,
            (None, None) => self.all.clone(),
        };
        result -= prohibited;
        result
    }

    fn phrase(&self, words: &[String]) -> RoaringTreemap {
        let Some((first, rest)) = words.split_first() else {
            return RoaringTreemap::new();
        };

        let mut candidates = self.postings.get(first).cloned().unwrap_or_default();
        for word in rest {
            match self.postings.get(word) {
                Some(ids) => candidates &= ids,
                None => return RoaringTreemap::new(),
            }
            if candidates.is_empty() {
                return candidates;
            }
        }

        candidates
            .iter()
            .filter(|id| {
                self.documents
                    .get(id)
                    .is_some_and(|document| contains_phrase(document, words))
            })
            .collect()
    }

    fn matching_words(&self, predicate: impl Fn(&str) -> bool) -> RoaringTreemap {
        let mut result = RoaringTreemap::new();
        for (word, ids) in &self.postings {
            if predicate(word) {
                result |= ids;
            }
        }
        result
    }
}

fn contains_phrase(document: &Document, words: &[String]) -> bool {
    let Some(starts) = document.positions.get(&words[0]) else {
        return false;
    };

    starts.iter().any(|&start| {
        words.iter().enumerate().skip(1).all(|(offset, word)| {
            document.positions.get(word).is_some_and(|positions| {
                positions.binary_search(&(start + offset as u32)).is_ok()
            })
        })
    })
}

fn wildcard_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    let mut expression = String::with_capacity(pattern.len() + 8);
    expression.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expression.push_str(".*"),
            '?' => expression.push('.'),
            other => expression.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    expression.push('$');
    Regex::new(&expression)
}

/// An [`IndexEngine`] holding everything in memory. Nothing is persisted.
pub struct MemoryIndexEngine {
    index: RwLock<InvertedIndex>,
    builder: Arc<StandardQueryBuilder>,
}

impl MemoryIndexEngine {
    pub fn new() -> Self {
        Self {
            index: RwLock::new(InvertedIndex::default()),
            builder: Arc::new(StandardQueryBuilder::new()),
        }
    }

    /// Whether `content_id` currently has indexed content.
    pub fn contains(&self, content_id: ContentId) -> bool {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .all
            .contains(content_id.0)
    }
}

impl Default for MemoryIndexEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexEngine for MemoryIndexEngine {
    fn initialize(&self) -> Result<()> {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        *index = InvertedIndex::default();
        Ok(())
    }

    fn update(&self, content_id: ContentId, text: &str, cancel: &CancellationToken) -> Result<()> {
        let mut document = Document::default();
        for (position, word) in analyze(text).into_iter().enumerate() {
            if position % CANCELLATION_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                return Err(Cancelled.into());
            }
            document
                .positions
                .entry(word)
                .or_default()
                .push(position as u32);
        }
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }

        let words = document.positions.len();
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        index.remove_document(content_id.0);
        index.add_document(content_id.0, document);
        debug!(content_id = %content_id, words, "Indexed content");
        Ok(())
    }

    fn remove(&self, content_id: ContentId, _cancel: &CancellationToken) -> Result<()> {
        let removed = self
            .index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove_document(content_id.0);
        if removed {
            debug!(content_id = %content_id, "Removed content");
        }
        Ok(())
    }

    fn search(&self, query: &Query) -> ContentSearchResult {
        if !query.is_valid() {
            return ContentSearchResult::syntax_errors(query.syntax_errors.clone());
        }

        let ids = self
            .index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .evaluate(&query.root);

        ContentSearchResult {
            content_ids: ids.iter().map(ContentId).collect(),
            syntax_errors: Vec::new(),
            warnings: query.warnings.clone(),
        }
    }

    fn query_builder(&self) -> Arc<dyn QueryBuilder> {
        self.builder.clone()
    }

    fn stats(&self) -> EngineStats {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        EngineStats {
            documents: index.all.len(),
            terms: index.postings.len(),
            postings: index.postings.values().map(|ids| ids.len()).sum(),
        }
    }
}
