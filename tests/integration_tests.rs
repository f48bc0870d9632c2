//! Integration tests for live_index
//!
//! These tests run the mirror and the indexer against real temporary directories with
//! native change notifications, and validate searches through the facade.

use anyhow::Result;
use live_index::fs::{FileNameFilter, MirrorOptions, WatchTarget, WatchTargetState};
use live_index::index::{
    IndexFacade, IndexOptions, MemoryIndexEngine, ProcessorOptions, Query, Scheduling,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Setup context holding the running facade and its temp directories
struct TestContext {
    facade: IndexFacade,
    root: PathBuf,
    _watched: TempDir, // Keep alive for test duration
    _links: TempDir,
}

impl Drop for TestContext {
    fn drop(&mut self) {
        let _ = self.facade.dispose();
    }
}

impl TestContext {
    fn search(&self, text: &str) -> Vec<PathBuf> {
        let mut paths = self.facade.search_text(text).file_names;
        paths.sort();
        paths
    }

    fn content_ids(&self, text: &str) -> usize {
        let query = self.facade.query_builder().parse(text);
        self.facade.engine().search(&query).content_ids.len()
    }
}

/// Creates a watched temp directory with `files`, starts a facade on it and waits for the
/// initial scan to be indexed.
fn setup(files: &[(&str, &str)]) -> Result<TestContext> {
    let watched = TempDir::new()?;
    let links = TempDir::new()?;
    // Resolve symlinked temp locations such as /var -> /private/var
    let root = watched.path().canonicalize()?;

    for (name, content) in files {
        let path = root.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
    }

    let facade = IndexFacade::new(
        Arc::new(MemoryIndexEngine::new()),
        MirrorOptions {
            idle_delay: Duration::from_millis(20),
            allowable_path_synchronization_lag: Duration::from_millis(50),
            debounce: Duration::from_millis(20),
        },
        IndexOptions {
            idle_delay: Duration::from_millis(20),
            throttle_delay: Duration::from_millis(50),
            scheduling: Scheduling::SmallestFirst,
            processor: ProcessorOptions {
                hardlink_directory: Some(links.path().join("links")),
                ..ProcessorOptions::default()
            },
        },
        FileNameFilter::accept_all(),
    )?;
    facade.watch(WatchTarget::directory(&root)?);
    facade.run()?;

    let ctx = TestContext {
        facade,
        root,
        _watched: watched,
        _links: links,
    };
    let expected = files.len() as u64;
    assert!(
        wait_until(|| ctx.facade.engine().stats().documents == expected
            && ctx.facade.pending().is_empty()),
        "initial scan was not indexed"
    );
    Ok(ctx)
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(15);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    condition()
}

fn write(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content)?;
    Ok(())
}

// =============================================================================
// Indexing Tests
// =============================================================================

#[test]
fn test_initial_scan_is_searchable() -> Result<()> {
    let ctx = setup(&[("hello.txt", "hello there"), ("world.txt", "the whole world")])?;

    assert_eq!(ctx.search("hello"), vec![ctx.root.join("hello.txt")]);
    assert_eq!(ctx.search("world"), vec![ctx.root.join("world.txt")]);
    assert_eq!(ctx.search("the").len(), 2);
    assert!(ctx.search("absent").is_empty());

    Ok(())
}

#[test]
fn test_new_file_becomes_searchable() -> Result<()> {
    let ctx = setup(&[("hello.txt", "hello")])?;

    write(&ctx.root.join("later.txt"), "arrived later")?;
    assert!(
        wait_until(|| ctx.search("arrived") == vec![ctx.root.join("later.txt")]),
        "created file was not indexed"
    );

    Ok(())
}

#[test]
fn test_nested_file_has_single_content_id() -> Result<()> {
    let ctx = setup(&[("hello.txt", "hello")])?;

    std::fs::create_dir(ctx.root.join("sub"))?;
    write(&ctx.root.join("sub").join("file.txt"), "a needle in a haystack")?;

    assert!(
        wait_until(|| ctx.search("needle") == vec![ctx.root.join("sub").join("file.txt")]),
        "nested file was not indexed"
    );
    assert!(
        wait_until(|| ctx.content_ids("needle") == 1),
        "nested file is indexed under more than one content id"
    );

    Ok(())
}

#[test]
fn test_modified_file_is_reindexed() -> Result<()> {
    let ctx = setup(&[("notes.txt", "first draft")])?;

    write(&ctx.root.join("notes.txt"), "second revision")?;
    assert!(
        wait_until(|| ctx.search("revision").len() == 1 && ctx.search("draft").is_empty()),
        "modified content was not reindexed"
    );

    Ok(())
}

#[test]
fn test_deleted_file_disappears_from_results() -> Result<()> {
    let ctx = setup(&[("hello.txt", "hello"), ("world.txt", "world")])?;

    std::fs::remove_file(ctx.root.join("hello.txt"))?;
    assert!(
        wait_until(|| ctx.search("hello").is_empty()),
        "deleted file is still found"
    );
    assert!(
        wait_until(|| ctx.content_ids("hello") == 0),
        "deleted content is still indexed"
    );
    assert_eq!(ctx.search("world"), vec![ctx.root.join("world.txt")]);

    Ok(())
}

#[test]
fn test_renamed_file_keeps_content_under_new_path() -> Result<()> {
    let ctx = setup(&[("before.txt", "movable content")])?;

    std::fs::rename(ctx.root.join("before.txt"), ctx.root.join("after.txt"))?;
    assert!(
        wait_until(|| ctx.search("movable") == vec![ctx.root.join("after.txt")]),
        "renamed file is not found under its new path"
    );
    assert!(
        wait_until(|| ctx.content_ids("movable") == 1),
        "renamed file is indexed under more than one content id"
    );

    Ok(())
}

#[test]
fn test_deleted_directory_removes_its_files() -> Result<()> {
    let ctx = setup(&[("dir/a.txt", "alpha"), ("dir/b.txt", "beta"), ("c.txt", "gamma")])?;

    std::fs::remove_dir_all(ctx.root.join("dir"))?;
    assert!(
        wait_until(|| ctx.search("alpha").is_empty() && ctx.search("beta").is_empty()),
        "files of a deleted directory are still found"
    );
    assert_eq!(ctx.search("gamma").len(), 1);

    Ok(())
}

// =============================================================================
// Query Tests
// =============================================================================

#[test]
fn test_purely_negative_query_warns_and_matches() -> Result<()> {
    let ctx = setup(&[("hello.txt", "hello"), ("world.txt", "world")])?;

    let result = ctx.facade.search_text("-hello");
    assert_eq!(result.file_names, vec![ctx.root.join("world.txt")]);
    assert_eq!(result.warnings.len(), 1);
    assert!(result.syntax_errors.is_empty());

    Ok(())
}

#[test]
fn test_syntax_errors_are_reported() -> Result<()> {
    let ctx = setup(&[("hello.txt", "hello")])?;

    let result = ctx.facade.search_text("(hello");
    assert!(!result.syntax_errors.is_empty());
    assert!(result.file_names.is_empty());

    let result = ctx.facade.search(&Query::invalid("broken"));
    assert_eq!(result.syntax_errors, vec!["broken".to_string()]);

    Ok(())
}

#[test]
fn test_boolean_queries() -> Result<()> {
    let ctx = setup(&[
        ("one.txt", "red green"),
        ("two.txt", "red blue"),
        ("three.txt", "yellow"),
    ])?;

    assert_eq!(ctx.search("red AND green"), vec![ctx.root.join("one.txt")]);
    assert_eq!(ctx.search("green OR yellow").len(), 2);
    assert_eq!(ctx.search("red -blue"), vec![ctx.root.join("one.txt")]);
    assert_eq!(ctx.search("\"red blue\""), vec![ctx.root.join("two.txt")]);
    assert_eq!(ctx.search("yel*"), vec![ctx.root.join("three.txt")]);

    Ok(())
}

// =============================================================================
// Mirror Tests
// =============================================================================

#[test]
fn test_mirror_tree_shape() -> Result<()> {
    let ctx = setup(&[("a.txt", "a"), ("sub/b.txt", "b")])?;

    let name = ctx
        .root
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let rendered = ctx.facade.mirror().tree().render(Some(&ctx.root), None);
    assert_eq!(rendered, format!("{}/\n\ta.txt\n\tsub/\n\t\tb.txt\n", name));

    let target = WatchTarget::directory(&ctx.root)?;
    assert_eq!(
        ctx.facade.mirror().target_state(&target),
        Some(WatchTargetState::Active)
    );

    Ok(())
}
