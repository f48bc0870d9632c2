//! Change notifier.
//!
//! Keeps one native subscription per [`WatchTarget`] and translates debounced `notify`
//! events into [`Change`] values sent over an mpsc channel. Directory targets are watched
//! recursively and report [`EntryType::Uncertain`]; file targets watch their parent
//! directory and only report events for the target's own name.
//!
//! A subscription is bound to a directory handle rather than a path. If the watched
//! directory itself is renamed, events keep arriving with stale paths, which is what
//! [`Watcher::is_path_correct`] and [`Watcher::assert_path_correct`] detect.

use crate::collections::lock;
use crate::fs::model::{Change, ChangeType, EntryType, SubscriptionId, WatchTarget};
use crate::fs::platform::DirectoryHandle;
use crate::utils::{paths_equal, segment_key};
use anyhow::{Context, Result};
use notify_debouncer_full::{
    new_debouncer,
    notify::{
        event::{ModifyKind, RenameMode},
        EventKind, RecommendedWatcher, RecursiveMode,
    },
    DebounceEventResult, Debouncer, RecommendedCache,
};
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("observed directory was moved. Initial path: {}, current path: {actual}", .expected.display())]
    PathDrift { expected: PathBuf, actual: String },
}

/// What a [`Watcher`] delivers to its consumer.
#[derive(Debug, Clone)]
pub enum WatcherEvent {
    Change(Change),
    /// The subscription for `target` broke. The watcher does not retry.
    Error { target: WatchTarget, message: String },
}

type NativeDebouncer = Debouncer<RecommendedWatcher, RecommendedCache>;

struct Subscription {
    id: SubscriptionId,
    debouncer: Option<NativeDebouncer>,
    handle: Option<DirectoryHandle>,
}

struct WatcherState {
    enabled: bool,
    next_id: u64,
    subscriptions: FxHashMap<WatchTarget, Subscription>,
}

pub struct Watcher {
    debounce: Duration,
    sender: Sender<WatcherEvent>,
    state: Mutex<WatcherState>,
}

impl Watcher {
    /// Create a disabled watcher delivering events to `sender`.
    pub fn new(debounce: Duration, sender: Sender<WatcherEvent>) -> Self {
        Self {
            debounce,
            sender,
            state: Mutex::new(WatcherState {
                enabled: false,
                next_id: 1,
                subscriptions: FxHashMap::default(),
            }),
        }
    }

    /// Subscribe to `target`. Idempotent; the native subscription starts once enabled.
    pub fn watch(&self, target: &WatchTarget) -> Result<()> {
        let mut state = lock(&self.state);
        if state.subscriptions.contains_key(target) {
            return Ok(());
        }

        let id = SubscriptionId(state.next_id);
        state.next_id += 1;
        let mut subscription = Subscription {
            id,
            debouncer: None,
            handle: None,
        };

        if state.enabled {
            self.start(target, &mut subscription)?;
        }
        state.subscriptions.insert(target.clone(), subscription);
        Ok(())
    }

    pub fn unwatch(&self, target: &WatchTarget) {
        let removed = lock(&self.state).subscriptions.remove(target);
        if removed.is_some() {
            debug!(target = %target, "Unwatched");
        }
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.state).enabled
    }

    /// Start or stop every native subscription. Enabling records each watched directory's
    /// current location for drift detection.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = lock(&self.state);
        if state.enabled == enabled {
            return;
        }
        state.enabled = enabled;

        for (target, subscription) in state.subscriptions.iter_mut() {
            if enabled {
                if let Err(e) = self.start(target, subscription) {
                    let _ = self.sender.send(WatcherEvent::Error {
                        target: target.clone(),
                        message: format!("{:#}", e),
                    });
                }
            } else {
                subscription.debouncer = None;
                subscription.handle = None;
            }
        }
    }

    /// Whether changes delivered by `id` still come from a live subscription.
    pub fn is_subscription_active(&self, id: SubscriptionId) -> bool {
        let state = lock(&self.state);
        state.enabled
            && state
                .subscriptions
                .values()
                .any(|subscription| subscription.id == id && subscription.debouncer.is_some())
    }

    /// `false` if the directory watched for `target` is no longer at its recorded path.
    ///
    /// Unknown or stopped subscriptions are considered correct.
    pub fn is_path_correct(&self, target: &WatchTarget) -> bool {
        let state = lock(&self.state);
        match state
            .subscriptions
            .get(target)
            .and_then(|subscription| subscription.handle.as_ref())
        {
            Some(handle) => check_handle(handle).is_ok(),
            None => true,
        }
    }

    /// Fail with [`WatcherError::PathDrift`] if the subscription that delivered `change`
    /// reports stale paths.
    pub fn assert_path_correct(&self, change: &Change) -> Result<(), WatcherError> {
        let Some(source) = change.source else {
            return Ok(());
        };

        let state = lock(&self.state);
        match state
            .subscriptions
            .values()
            .find(|subscription| subscription.id == source)
            .and_then(|subscription| subscription.handle.as_ref())
        {
            Some(handle) => check_handle(handle),
            None => Ok(()),
        }
    }

    fn start(&self, target: &WatchTarget, subscription: &mut Subscription) -> Result<()> {
        let directory = target.watched_directory().to_path_buf();
        let handle = DirectoryHandle::open(&directory)
            .with_context(|| format!("Failed to open watched directory {}", directory.display()))?;

        let sender = self.sender.clone();
        let handler_target = target.clone();
        let id = subscription.id;
        let name_filter = match target.entry_type() {
            EntryType::File => target
                .path()
                .file_name()
                .map(|name| segment_key(&name.to_string_lossy())),
            _ => None,
        };

        let mut debouncer = new_debouncer(
            self.debounce,
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    for event in events {
                        let changes = translate(
                            &event.kind,
                            &event.paths,
                            &handler_target,
                            name_filter.as_deref(),
                        );
                        for change in changes {
                            if sender.send(WatcherEvent::Change(change.with_source(id))).is_err() {
                                debug!("Watcher channel closed");
                                return;
                            }
                        }
                    }
                }
                Err(errors) => {
                    for error in errors {
                        warn!(target = %handler_target, error = %error, "Watcher error");
                        let _ = sender.send(WatcherEvent::Error {
                            target: handler_target.clone(),
                            message: error.to_string(),
                        });
                    }
                }
            },
        )
        .context("Failed to create file watcher")?;

        let mode = match target.entry_type() {
            EntryType::Directory => RecursiveMode::Recursive,
            _ => RecursiveMode::NonRecursive,
        };
        debouncer
            .watch(&directory, mode)
            .with_context(|| format!("Failed to watch {}", directory.display()))?;

        info!(target = %target, "Watching for changes");
        subscription.debouncer = Some(debouncer);
        subscription.handle = Some(handle);
        Ok(())
    }
}

fn check_handle(handle: &DirectoryHandle) -> Result<(), WatcherError> {
    match handle.current_path() {
        Some(actual) if paths_equal(&actual, handle.initial_path()) => Ok(()),
        actual => Err(WatcherError::PathDrift {
            expected: handle.initial_path().to_path_buf(),
            actual: actual.map_or_else(|| "<missing>".to_string(), |p| p.display().to_string()),
        }),
    }
}

fn name_matches(path: &Path, name_filter: Option<&str>) -> bool {
    match name_filter {
        Some(expected) => path
            .file_name()
            .is_some_and(|name| segment_key(&name.to_string_lossy()) == expected),
        None => true,
    }
}

/// Map one debounced event to zero or more changes.
fn translate(
    kind: &EventKind,
    paths: &[PathBuf],
    target: &WatchTarget,
    name_filter: Option<&str>,
) -> Vec<Change> {
    let entry_type = match target.entry_type() {
        EntryType::File => EntryType::File,
        _ => EntryType::Uncertain,
    };
    let Some(first) = paths.first() else {
        return Vec::new();
    };

    let single = |change_type: ChangeType, path: &Path| -> Vec<Change> {
        if !name_matches(path, name_filter) {
            return Vec::new();
        }
        // file targets ignore directories that happen to share the name
        if name_filter.is_some() && path.is_dir() {
            return Vec::new();
        }
        vec![Change::new(entry_type, change_type, path)]
    };

    match kind {
        EventKind::Create(_) => single(ChangeType::Created, first),
        EventKind::Remove(_) => single(ChangeType::Deleted, first),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => {
            let (old_path, new_path) = (&paths[0], &paths[1]);
            if name_matches(old_path, name_filter) || name_matches(new_path, name_filter) {
                vec![Change::renamed(entry_type, old_path, new_path)]
            } else {
                Vec::new()
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => single(ChangeType::Deleted, first),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => single(ChangeType::Created, first),
        EventKind::Modify(ModifyKind::Name(_)) => {
            let change_type = if first.exists() {
                ChangeType::Created
            } else {
                ChangeType::Deleted
            };
            single(change_type, first)
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => single(ChangeType::Changed, first),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}
