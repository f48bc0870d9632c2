//! In-memory mirror of a directory hierarchy.
//!
//! Nodes live in an arena addressed by [`EntryId`]; parent and child links are ids, not
//! references. Child lookup is case-insensitive. A node removed from its parent keeps its
//! own subtree until [`EntryTree::purge`] is called, but it no longer has a path.

use crate::collections::lock;
use crate::fs::model::EntryKind;
use crate::utils::{combine_segments, segment_key, split_path};
use anyhow::{bail, Result};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::fmt;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Stable handle of a tree node. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EntryId(u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry:{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Children {
    directories: FxHashMap<String, EntryId>,
    files: FxHashMap<String, EntryId>,
    unclassified: FxHashMap<String, EntryId>,
}

impl Children {
    fn of_kind(&mut self, kind: EntryKind) -> Option<&mut FxHashMap<String, EntryId>> {
        match kind {
            EntryKind::Directory => Some(&mut self.directories),
            EntryKind::File => Some(&mut self.files),
            EntryKind::Unclassified => Some(&mut self.unclassified),
            EntryKind::Root => None,
        }
    }

    fn find(&self, key: &str) -> Option<EntryId> {
        self.directories
            .get(key)
            .or_else(|| self.files.get(key))
            .or_else(|| self.unclassified.get(key))
            .copied()
    }

    fn all(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.files
            .values()
            .chain(self.unclassified.values())
            .chain(self.directories.values())
            .copied()
    }
}

#[derive(Debug)]
struct Node<T> {
    name: String,
    kind: EntryKind,
    parent: Option<EntryId>,
    data: T,
    children: Children,
}

struct TreeInner<T> {
    nodes: FxHashMap<EntryId, Node<T>>,
    root: EntryId,
    next_id: u64,
}

impl<T> TreeInner<T> {
    fn allocate(&mut self, name: String, kind: EntryKind, parent: Option<EntryId>, data: T) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            Node {
                name,
                kind,
                parent,
                data,
                children: Children::default(),
            },
        );
        id
    }

    fn lookup(&self, parent: EntryId, name: &str) -> Option<EntryId> {
        self.nodes.get(&parent)?.children.find(&segment_key(name))
    }

    fn directory(&self, parent: EntryId, name: &str) -> Option<EntryId> {
        self.nodes
            .get(&parent)?
            .children
            .directories
            .get(&segment_key(name))
            .copied()
    }

    fn find(&self, segments: &[String]) -> Option<EntryId> {
        let (name, ancestors) = segments.split_last()?;
        let mut current = self.root;
        for segment in ancestors {
            current = self.directory(current, segment)?;
        }
        self.lookup(current, name)
    }

    fn detach(&mut self, id: EntryId) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        let Some(parent) = node.parent.take() else {
            return;
        };
        let key = segment_key(&node.name);
        let kind = node.kind;

        if let Some(children) = self
            .nodes
            .get_mut(&parent)
            .and_then(|parent| parent.children.of_kind(kind))
        {
            if children.get(&key) == Some(&id) {
                children.remove(&key);
            }
        }
    }

    fn attach(&mut self, parent: EntryId, id: EntryId) -> Result<()> {
        let Some(node) = self.nodes.get_mut(&id) else {
            bail!("{} is not part of the tree", id);
        };
        node.parent = Some(parent);
        let key = segment_key(&node.name);
        let kind = node.kind;

        match self
            .nodes
            .get_mut(&parent)
            .and_then(|parent| parent.children.of_kind(kind))
        {
            Some(children) => {
                children.insert(key, id);
                Ok(())
            }
            None => bail!("cannot attach {:?} entry", kind),
        }
    }

    fn is_attached(&self, mut id: EntryId) -> bool {
        loop {
            if id == self.root {
                return true;
            }
            match self.nodes.get(&id).and_then(|node| node.parent) {
                Some(parent) => id = parent,
                None => return false,
            }
        }
    }
}

/// Tree of entries carrying a `T` payload, guarded by one tree-wide lock.
pub struct EntryTree<T> {
    inner: Mutex<TreeInner<T>>,
    default_data: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T: Clone> EntryTree<T> {
    /// Create an empty tree. `default_data` fills intermediate directories created by
    /// [`add`](Self::add).
    pub fn new(default_data: impl Fn() -> T + Send + Sync + 'static) -> Self {
        let mut nodes = FxHashMap::default();
        let root = EntryId(0);
        nodes.insert(
            root,
            Node {
                name: String::new(),
                kind: EntryKind::Root,
                parent: None,
                data: default_data(),
                children: Children::default(),
            },
        );

        Self {
            inner: Mutex::new(TreeInner {
                nodes,
                root,
                next_id: 1,
            }),
            default_data: Box::new(default_data),
        }
    }

    /// Insert an entry at `path`, creating missing intermediate directories.
    ///
    /// An existing entry of the same kind and name is replaced (and detached).
    pub fn add(&self, kind: EntryKind, path: &Path, data: T) -> Result<EntryId> {
        if kind == EntryKind::Root {
            bail!("a root entry cannot be added");
        }
        let Some(segments) = split_path(path) else {
            bail!("expected an absolute path, got {}", path.display());
        };

        let mut inner = lock(&self.inner);
        let parent = self.ensure_parent(&mut inner, &segments)?;
        let name = segments[segments.len() - 1].clone();

        let replaced = inner
            .nodes
            .get_mut(&parent)
            .and_then(|node| node.children.of_kind(kind))
            .and_then(|children| children.get(&segment_key(&name)).copied());
        if let Some(replaced) = replaced {
            inner.detach(replaced);
        }

        let id = inner.allocate(name, kind, None, data);
        inner.attach(parent, id)?;
        Ok(id)
    }

    /// Detach an entry from its parent. Its descendants stay reachable through the id.
    pub fn remove(&self, id: EntryId) {
        let mut inner = lock(&self.inner);
        if id != inner.root {
            inner.detach(id);
        }
    }

    /// Re-parent and rename an entry so it is found at `path`.
    pub fn move_entry(&self, id: EntryId, path: &Path) -> Result<()> {
        let Some(segments) = split_path(path) else {
            bail!("expected an absolute path, got {}", path.display());
        };

        let mut inner = lock(&self.inner);
        if id == inner.root {
            bail!("the root entry cannot be moved");
        }
        inner.detach(id);

        let parent = self.ensure_parent(&mut inner, &segments)?;
        let name = segments[segments.len() - 1].clone();
        let Some(node) = inner.nodes.get_mut(&id) else {
            bail!("{} is not part of the tree", id);
        };
        node.name = name;
        let kind = node.kind;
        let key = segment_key(&node.name);

        let replaced = inner
            .nodes
            .get_mut(&parent)
            .and_then(|node| node.children.of_kind(kind))
            .and_then(|children| children.get(&key).copied());
        if let Some(replaced) = replaced {
            inner.detach(replaced);
        }

        inner.attach(parent, id)
    }

    /// Look up the entry at `path`: directories win over files, files over unclassified.
    pub fn find(&self, path: &Path) -> Option<EntryId> {
        let segments = split_path(path)?;
        lock(&self.inner).find(&segments)
    }

    /// Directory entries on the way to `path`, root to leaf, excluding `path` itself.
    /// Stops at the first missing segment.
    pub fn find_ancestors(&self, path: &Path) -> Vec<EntryId> {
        let Some(segments) = split_path(path) else {
            return Vec::new();
        };

        let inner = lock(&self.inner);
        let mut result = Vec::new();
        let mut current = inner.root;
        for segment in &segments[..segments.len().saturating_sub(1)] {
            match inner.directory(current, segment) {
                Some(directory) => {
                    result.push(directory);
                    current = directory;
                }
                None => break,
            }
        }
        result
    }

    /// Current path of an entry, or `None` if it (or an ancestor) was removed.
    pub fn path(&self, id: EntryId) -> Option<PathBuf> {
        let inner = lock(&self.inner);
        let mut names = Vec::new();
        let mut current = id;
        loop {
            if current == inner.root {
                break;
            }
            let node = inner.nodes.get(&current)?;
            names.push(node.name.as_str());
            current = node.parent?;
        }

        if names.is_empty() {
            return None;
        }
        names.reverse();
        Some(combine_segments(&names))
    }

    pub fn kind(&self, id: EntryId) -> Option<EntryKind> {
        lock(&self.inner).nodes.get(&id).map(|node| node.kind)
    }

    pub fn data(&self, id: EntryId) -> Option<T> {
        lock(&self.inner).nodes.get(&id).map(|node| node.data.clone())
    }

    /// Mutate an entry's payload in place under the tree lock.
    pub fn with_data_mut<R>(&self, id: EntryId, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        lock(&self.inner).nodes.get_mut(&id).map(|node| f(&mut node.data))
    }

    /// Whether the entry is still reachable from the root.
    pub fn is_attached(&self, id: EntryId) -> bool {
        lock(&self.inner).is_attached(id)
    }

    /// Direct children as `(id, kind)`, files first, then unclassified, then directories.
    pub fn children(&self, id: EntryId) -> Vec<(EntryId, EntryKind)> {
        let inner = lock(&self.inner);
        let Some(node) = inner.nodes.get(&id) else {
            return Vec::new();
        };
        node.children
            .all()
            .filter_map(|child| inner.nodes.get(&child).map(|node| (child, node.kind)))
            .collect()
    }

    /// Drop a detached entry and everything below it from the arena.
    pub fn purge(&self, id: EntryId) {
        let mut inner = lock(&self.inner);
        if inner.is_attached(id) {
            return;
        }

        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            if let Some(node) = inner.nodes.remove(&current) {
                pending.extend(node.children.all());
            }
        }
    }

    /// Number of entries held in the arena, detached ones included. The root is not counted.
    pub fn len(&self) -> usize {
        lock(&self.inner).nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_parent(&self, inner: &mut TreeInner<T>, segments: &[String]) -> Result<EntryId> {
        let mut current = inner.root;
        for segment in &segments[..segments.len().saturating_sub(1)] {
            current = match inner.directory(current, segment) {
                Some(directory) => directory,
                None => {
                    let directory = inner.allocate(
                        segment.clone(),
                        EntryKind::Directory,
                        None,
                        (self.default_data)(),
                    );
                    inner.attach(current, directory)?;
                    directory
                }
            };
        }
        Ok(current)
    }

    /// Render the subtree at `path` (the whole tree for `None`).
    ///
    /// Each level lists files, then unclassified entries (suffixed `?`), then directories
    /// (suffixed `/`), sorted case-insensitively and indented with tabs. `describe` may
    /// append text after each name.
    pub fn render(&self, path: Option<&Path>, describe: Option<&dyn Fn(&T) -> String>) -> String {
        let inner = lock(&self.inner);
        let start = match path {
            Some(path) => match split_path(path).and_then(|segments| inner.find(&segments)) {
                Some(id) => id,
                None => return String::new(),
            },
            None => inner.root,
        };

        let mut output = String::new();
        let nesting = if start == inner.root { -1 } else { 0 };
        render_node(&inner, start, nesting, describe, &mut output);
        output
    }
}

fn render_node<T>(
    inner: &TreeInner<T>,
    id: EntryId,
    nesting: i32,
    describe: Option<&dyn Fn(&T) -> String>,
    output: &mut String,
) {
    let Some(node) = inner.nodes.get(&id) else {
        return;
    };

    if nesting >= 0 {
        for _ in 0..nesting {
            output.push('\t');
        }
        output.push_str(&node.name);
        match node.kind {
            EntryKind::Directory => output.push('/'),
            EntryKind::Unclassified => output.push('?'),
            _ => {}
        }
        if let Some(describe) = describe {
            let _ = write!(output, " {}", describe(&node.data));
        }
        output.push('\n');
    }

    for group in [
        &node.children.files,
        &node.children.unclassified,
        &node.children.directories,
    ] {
        let mut entries: Vec<(&String, &EntryId)> = group.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        for (_, child) in entries {
            render_node(inner, *child, nesting + 1, describe, output);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tree() -> EntryTree<u32> {
        EntryTree::new(|| 0)
    }

    fn root() -> PathBuf {
        std::env::temp_dir().join("live_index_tree")
    }

    #[test]
    fn test_add_creates_intermediate_directories() {
        let tree = tree();
        let file = root().join("a").join("b").join("file.txt");
        let id = tree.add(EntryKind::File, &file, 7).unwrap();

        assert_eq!(tree.find(&file), Some(id));
        assert_eq!(tree.data(id), Some(7));
        assert_eq!(tree.path(id), Some(file.clone()));

        let directory = tree.find(&root().join("a")).unwrap();
        assert_eq!(tree.kind(directory), Some(EntryKind::Directory));
        assert_eq!(tree.data(directory), Some(0));
    }

    #[test]
    fn test_find_is_case_insensitive() {
        let tree = tree();
        let id = tree
            .add(EntryKind::File, &root().join("Docs").join("ReadMe.md"), 1)
            .unwrap();

        assert_eq!(tree.find(&root().join("docs").join("README.MD")), Some(id));
        assert_eq!(tree.path(id), Some(root().join("Docs").join("ReadMe.md")));
    }

    #[test]
    fn test_remove_detaches_subtree() {
        let tree = tree();
        let directory = tree.add(EntryKind::Directory, &root().join("dir"), 1).unwrap();
        let file = tree
            .add(EntryKind::File, &root().join("dir").join("f.txt"), 2)
            .unwrap();

        tree.remove(directory);

        assert_eq!(tree.find(&root().join("dir")), None);
        assert_eq!(tree.path(directory), None);
        assert_eq!(tree.path(file), None);
        assert!(!tree.is_attached(file));
        assert_eq!(tree.children(directory), vec![(file, EntryKind::File)]);

        let before = tree.len();
        tree.purge(directory);
        assert_eq!(tree.len(), before - 2);
        assert_eq!(tree.kind(file), None);
    }

    #[test]
    fn test_move_keeps_identity() {
        let tree = tree();
        let old_path = root().join("src").join("old.txt");
        let new_path = root().join("dst").join("new.txt");
        let id = tree.add(EntryKind::File, &old_path, 5).unwrap();

        tree.move_entry(id, &new_path).unwrap();

        assert_eq!(tree.find(&old_path), None);
        assert_eq!(tree.find(&new_path), Some(id));
        assert_eq!(tree.path(id), Some(new_path));
        assert_eq!(tree.data(id), Some(5));
    }

    #[test]
    fn test_moving_directory_moves_descendants() {
        let tree = tree();
        let directory = tree.add(EntryKind::Directory, &root().join("before"), 0).unwrap();
        let file = tree
            .add(EntryKind::File, &root().join("before").join("x.txt"), 1)
            .unwrap();

        tree.move_entry(directory, &root().join("after")).unwrap();

        assert_eq!(tree.path(file), Some(root().join("after").join("x.txt")));
    }

    #[test]
    fn test_find_ancestors_stops_at_missing_segment() {
        let tree = tree();
        tree.add(EntryKind::Directory, &root().join("a").join("b"), 1).unwrap();

        let ancestors = tree.find_ancestors(&root().join("a").join("b").join("c").join("d"));
        let paths: Vec<_> = ancestors.iter().filter_map(|id| tree.path(*id)).collect();

        assert_eq!(paths.last(), Some(&root().join("a").join("b")));
        assert!(paths.contains(&root().join("a")));
        assert!(!paths.contains(&root().join("a").join("b").join("c")));
    }

    #[test]
    fn test_add_rejects_relative_path() {
        let tree = tree();
        assert!(tree.add(EntryKind::File, Path::new("relative.txt"), 1).is_err());
        assert!(tree.find(Path::new("relative.txt")).is_none());
    }

    #[test]
    fn test_directory_wins_over_file_of_same_name() {
        let tree = tree();
        let path = root().join("same");
        let file = tree.add(EntryKind::File, &path, 1).unwrap();
        let directory = tree.add(EntryKind::Directory, &path, 2).unwrap();

        assert_eq!(tree.find(&path), Some(directory));
        tree.remove(directory);
        assert_eq!(tree.find(&path), Some(file));
    }

    #[test]
    fn test_with_data_mut() {
        let tree = tree();
        let id = tree.add(EntryKind::Directory, &root().join("d"), 1).unwrap();
        tree.with_data_mut(id, |data| *data += 41);
        assert_eq!(tree.data(id), Some(42));
    }

    #[test]
    fn test_render_orders_kinds_and_names() {
        let tree = tree();
        let base = root().join("render");
        tree.add(EntryKind::Directory, &base.join("zeta"), 0).unwrap();
        tree.add(EntryKind::File, &base.join("zeta").join("inner.txt"), 0).unwrap();
        tree.add(EntryKind::File, &base.join("B.txt"), 0).unwrap();
        tree.add(EntryKind::File, &base.join("a.txt"), 0).unwrap();
        tree.add(EntryKind::Unclassified, &base.join("pending"), 0).unwrap();
        tree.add(EntryKind::Directory, &base.join("alpha"), 0).unwrap();

        let rendered = tree.render(Some(&base), None);
        assert_eq!(
            rendered,
            "render/\n\ta.txt\n\tB.txt\n\tpending?\n\talpha/\n\tzeta/\n\t\tinner.txt\n"
        );
    }

    #[test]
    fn test_render_with_describe() {
        let tree = tree();
        let base = root().join("described");
        tree.add(EntryKind::File, &base.join("one.txt"), 1).unwrap();

        let describe = |data: &u32| format!("#{}", data);
        let rendered = tree.render(Some(&base), Some(&describe));
        assert!(rendered.contains("one.txt #1"));
    }

    #[test]
    fn test_concurrent_adds() {
        let tree = Arc::new(tree());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let tree = tree.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let path = root().join(format!("t{}", t)).join(format!("{}.txt", i));
                        tree.add(EntryKind::File, &path, i).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(tree.find(&root().join("t3").join("49.txt")).is_some());
    }
}
