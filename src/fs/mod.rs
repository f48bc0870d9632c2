//! Filesystem side: the entry tree, change notifications and the mirror that keeps the tree
//! in sync with disk.

pub mod filter;
pub mod mirror;
pub mod model;
pub mod platform;
pub mod tree;
pub mod watcher;

pub use filter::FileNameFilter;
pub use mirror::{Mirror, MirrorEvent, MirrorListener, MirrorOptions, MirrorTree, WatchTargetState};
pub use model::{
    Change, ChangeType, ContentId, ContentIdSequence, EntryAccessError, EntryKind, EntryType,
    FileEntry, Metadata, SubscriptionId, WatchTarget, WatchTargetError,
};
pub use tree::{EntryId, EntryTree};
pub use watcher::{Watcher, WatcherError, WatcherEvent};
