//! Change records delivered through watch keys.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind};

/// Rename trackers remembered while waiting for their paired event.
const TRACKED_RENAMES: usize = 64;

/// Identifier of a registered watch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(pub(crate) u64);

impl KeyId {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key#{}", self.0)
    }
}

/// Kind of change observed for an entry of a watched directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Deleted,
    Modified,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChangeKind::Created => "CREATED",
            ChangeKind::Deleted => "DELETED",
            ChangeKind::Modified => "MODIFIED",
        };
        f.pad(label)
    }
}

/// A single change record queued on a [`WatchKey`](super::WatchKey).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    path: PathBuf,
    kind: ChangeKind,
    key: KeyId,
}

impl ChangeEvent {
    pub(crate) fn new(path: PathBuf, kind: ChangeKind, key: KeyId) -> Self {
        Self { path, kind, key }
    }

    /// Absolute path of the entry that changed.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    /// Key of the watched directory the change was reported on.
    pub fn key(&self) -> KeyId {
        self.key
    }
}

/// Map a raw `notify` event to the changes it describes.
///
/// Renames become a delete of the old name and a create of the new one.
/// Access notifications carry no change and are dropped.
pub(crate) fn classify(kind: &EventKind, paths: &[PathBuf]) -> Vec<(PathBuf, ChangeKind)> {
    let all = |change: ChangeKind| -> Vec<(PathBuf, ChangeKind)> {
        paths.iter().map(|p| (p.clone(), change)).collect()
    };

    match kind {
        EventKind::Access(_) => Vec::new(),
        EventKind::Create(_) => all(ChangeKind::Created),
        EventKind::Remove(_) => all(ChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => all(ChangeKind::Deleted),
            RenameMode::To => all(ChangeKind::Created),
            RenameMode::Both => {
                let mut changes = Vec::with_capacity(paths.len());
                if let Some((to, from)) = paths.split_last() {
                    changes.extend(from.iter().map(|p| (p.clone(), ChangeKind::Deleted)));
                    changes.push((to.clone(), ChangeKind::Created));
                }
                changes
            }
            // Backends that cannot tell the direction of a rename.
            RenameMode::Any | RenameMode::Other => paths
                .iter()
                .map(|p| {
                    let change = if p.symlink_metadata().is_ok() {
                        ChangeKind::Created
                    } else {
                        ChangeKind::Deleted
                    };
                    (p.clone(), change)
                })
                .collect(),
        },
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => all(ChangeKind::Modified),
    }
}

/// Filters the paired rename event that repeats two halves already seen.
///
/// inotify reports a rename as a `From` half, a `To` half, and then a `Both`
/// event carrying both paths, all with the same tracker. Only backends that
/// send `Both` on its own get it classified.
#[derive(Debug, Default)]
pub(crate) struct RenameTracker {
    halves: VecDeque<usize>,
}

impl RenameTracker {
    /// True if `event` only repeats rename halves that were already delivered.
    pub(crate) fn is_repeat(&mut self, event: &Event) -> bool {
        let EventKind::Modify(ModifyKind::Name(mode)) = &event.kind else {
            return false;
        };
        let Some(tracker) = event.tracker() else {
            return false;
        };

        match mode {
            RenameMode::From | RenameMode::To => {
                if !self.halves.contains(&tracker) {
                    if self.halves.len() == TRACKED_RENAMES {
                        self.halves.pop_front();
                    }
                    self.halves.push_back(tracker);
                }
                false
            }
            RenameMode::Both => match self.halves.iter().position(|t| *t == tracker) {
                Some(pos) => {
                    self.halves.remove(pos);
                    true
                }
                None => false,
            },
            RenameMode::Any | RenameMode::Other => false,
        }
    }
}
