//! File name filtering for the mirror.
//!
//! Files rejected by the filter are never observed: neither scans nor change notifications
//! create entries for them. Directories are not filtered, so that an included file deep
//! inside an otherwise uninteresting directory is still found.

use crate::utils::{normalize_path_for_comparison, segment_key};
use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;

/// A deterministic predicate over absolute file paths.
///
/// - Include patterns: a file must match at least one (if any are given)
/// - Exclude patterns: a file must not match any
/// - Excluded directories: a file must not live below a directory with one of these names
///
/// Patterns are matched against the full path with `/` separators, so `**/.git/**` or
/// `*.rs` behave the same on every platform.
#[derive(Debug, Default, Clone)]
pub struct FileNameFilter {
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
    excluded_directories: Vec<String>,
}

impl FileNameFilter {
    /// A filter that accepts every file.
    pub fn accept_all() -> Self {
        Self::default()
    }

    pub fn new(include_patterns: &[String], exclude_patterns: &[String]) -> Result<Self> {
        Ok(Self {
            include: build_set(include_patterns, "include")?,
            exclude: build_set(exclude_patterns, "exclude")?,
            excluded_directories: Vec::new(),
        })
    }

    /// Parse semicolon-delimited patterns into a vector.
    ///
    /// Example: "**/*.rs;**/*.md" -> ["**/*.rs", "**/*.md"]
    pub fn parse_patterns(patterns: &str) -> Vec<String> {
        patterns
            .split(';')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Reject every file below a directory named `name`, at any depth.
    pub fn exclude_directory(mut self, name: &str) -> Self {
        let key = segment_key(name);
        if !key.is_empty() && !self.excluded_directories.contains(&key) {
            self.excluded_directories.push(key);
        }
        self
    }

    pub fn matches(&self, path: &Path) -> bool {
        if !self.excluded_directories.is_empty() {
            let mut ancestors = path.parent().into_iter().flat_map(|p| p.iter());
            if ancestors.any(|segment| {
                let key = segment_key(&segment.to_string_lossy());
                self.excluded_directories.contains(&key)
            }) {
                return false;
            }
        }

        let text = path.to_string_lossy().replace('\\', "/");
        let included = match &self.include {
            Some(set) => set.is_match(&text) || set.is_match(normalize_path_for_comparison(&text)),
            None => true,
        };
        if !included {
            return false;
        }

        match &self.exclude {
            Some(set) => !set.is_match(&text),
            None => true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_none() && self.exclude.is_none() && self.excluded_directories.is_empty()
    }
}

fn build_set(patterns: &[String], kind: &str) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }

    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .with_context(|| format!("Invalid {} glob pattern: {}", kind, pattern))?;
        builder.add(glob);
    }
    Ok(Some(
        builder
            .build()
            .with_context(|| format!("Failed to build {} GlobSet", kind))?,
    ))
}
