//! Watch registry: directory paths and their watch keys.
//!
//! Every watched directory gets its own non-recursive OS watch and one
//! [`WatchKey`]. OS notifications arrive keyed by path while callers hand out
//! keys, so the registry keeps both directions:
//!
//! ```text
//! by_path: /root/a   -> WatchKey(key#2)
//! by_key:  key#2     -> /root/a
//! ```
//!
//! The registry is owned by the dispatcher worker and is never shared.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::{RecursiveMode, Watcher};
use walkdir::WalkDir;

use super::error::WatchError;
use super::event::KeyId;
use super::key::{KeySignals, WatchKey};

/// How long a removal marker waits for the second notification of the same removal.
const REMOVAL_GRACE: Duration = Duration::from_secs(5);

/// Outcome of registering a directory tree.
#[derive(Debug)]
pub(crate) struct TreeRegistration {
    /// Canonical root of the walk.
    pub root: PathBuf,
    /// Directories registered by this walk (already watched ones excluded).
    pub registered: Vec<PathBuf>,
    /// Subdirectories that could not be walked or watched; siblings were still registered.
    pub failures: Vec<WatchError>,
}

/// Registry of watched directories backed by a `notify` watcher.
pub(crate) struct WatchRegistry<W> {
    backend: W,
    by_path: HashMap<PathBuf, WatchKey>,
    by_key: HashMap<KeyId, PathBuf>,
    /// Roots passed to `register_tree` that are still watched.
    roots: HashSet<PathBuf>,
    /// Directories released because they disappeared, awaiting their second
    /// removal notification (parent side and self side both report it).
    /// Markers expire after `removal_grace`, since some removals are only
    /// reported once.
    removed: HashMap<PathBuf, Instant>,
    removal_grace: Duration,
    next_id: u64,
    signals: KeySignals,
    follow_links: bool,
}

impl<W: Watcher> WatchRegistry<W> {
    /// Create an empty registry. Keys it creates signal on `signals`.
    pub fn new(backend: W, signals: KeySignals, follow_links: bool) -> Self {
        Self {
            backend,
            by_path: HashMap::new(),
            by_key: HashMap::new(),
            roots: HashSet::new(),
            removed: HashMap::new(),
            removal_grace: REMOVAL_GRACE,
            next_id: 1,
            signals,
            follow_links,
        }
    }

    /// Register `root` and every directory beneath it.
    ///
    /// Fails only if `root` itself is missing, not a directory, or cannot be
    /// watched. Failures below the root are collected in the report.
    pub fn register_tree(&mut self, root: &Path) -> Result<TreeRegistration, WatchError> {
        let root = fs::canonicalize(root).map_err(|e| WatchError::from_io(root.to_path_buf(), e))?;
        let metadata = fs::metadata(&root).map_err(|e| WatchError::from_io(root.clone(), e))?;
        if !metadata.is_dir() {
            return Err(WatchError::NotADirectory { path: root });
        }

        let mut report = TreeRegistration {
            root: root.clone(),
            registered: Vec::new(),
            failures: Vec::new(),
        };

        if self.register_path(&root)? {
            report.registered.push(root.clone());
        }

        let walker = WalkDir::new(&root)
            .min_depth(1)
            .follow_links(self.follow_links)
            .into_iter()
            .filter_entry(|entry| entry.file_type().is_dir());

        for entry in walker {
            match entry {
                Ok(entry) => match self.register_path(entry.path()) {
                    Ok(true) => report.registered.push(entry.into_path()),
                    Ok(false) => {}
                    Err(e) => report.failures.push(e),
                },
                Err(e) => report.failures.push(e.into()),
            }
        }

        self.roots.insert(root);
        Ok(report)
    }

    /// Register a single directory.
    ///
    /// Returns `false` if it was already registered.
    pub fn register_path(&mut self, dir: &Path) -> Result<bool, WatchError> {
        if self.by_path.contains_key(dir) {
            return Ok(false);
        }

        self.backend
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| WatchError::watch_failed(dir.to_path_buf(), &e))?;

        let id = KeyId(self.next_id);
        self.next_id += 1;

        let key = WatchKey::new(id, dir.to_path_buf(), self.signals.clone());
        self.by_path.insert(dir.to_path_buf(), key);
        self.by_key.insert(id, dir.to_path_buf());
        self.removed.remove(dir);

        crate::debug_event!("registry", "watching", "{id} {}", dir.display());
        Ok(true)
    }

    /// Release `dir` and every registered directory beneath it.
    ///
    /// Returns the released keys, already cancelled. Empty if `dir` was not
    /// registered.
    pub fn unregister_path(&mut self, dir: &Path) -> Vec<WatchKey> {
        if !self.by_path.contains_key(dir) {
            return Vec::new();
        }

        let doomed: Vec<PathBuf> = self
            .by_path
            .keys()
            .filter(|p| p.starts_with(dir))
            .cloned()
            .collect();

        let released: Vec<WatchKey> = doomed.iter().filter_map(|p| self.release(p)).collect();
        self.roots.retain(|root| !root.starts_with(dir));

        crate::debug_event!(
            "registry",
            "released",
            "{} directories under {}",
            released.len(),
            dir.display()
        );
        released
    }

    /// Release a directory that vanished from disk.
    ///
    /// The second removal notification for it is then swallowed by
    /// [`take_removed`](Self::take_removed).
    pub fn unregister_removed(&mut self, dir: &Path) -> Vec<WatchKey> {
        let grace = self.removal_grace;
        self.removed.retain(|_, at| at.elapsed() < grace);

        let released = self.unregister_path(dir);
        if !released.is_empty() {
            self.removed.insert(dir.to_path_buf(), Instant::now());
        }
        released
    }

    /// True once per directory released by [`unregister_removed`](Self::unregister_removed),
    /// as long as its marker has not expired.
    pub fn take_removed(&mut self, path: &Path) -> bool {
        self.removed
            .remove(path)
            .is_some_and(|at| at.elapsed() < self.removal_grace)
    }

    /// Drop a pending removal marker, e.g. when the path is created again.
    pub fn forget_removed(&mut self, path: &Path) {
        self.removed.remove(path);
    }

    /// Key an OS notification about `path` belongs to.
    ///
    /// Entries are reported on their parent directory's key; a watched
    /// directory whose parent is not watched reports on its own key.
    pub fn key_for_event(&self, path: &Path) -> Option<WatchKey> {
        path.parent()
            .and_then(|parent| self.by_path.get(parent))
            .or_else(|| self.by_path.get(path))
            .cloned()
    }

    #[cfg(test)]
    pub fn key_for_path(&self, dir: &Path) -> Option<&WatchKey> {
        self.by_path.get(dir)
    }

    #[cfg(test)]
    pub fn path_for_key(&self, id: KeyId) -> Option<&Path> {
        self.by_key.get(&id).map(PathBuf::as_path)
    }

    pub fn contains(&self, dir: &Path) -> bool {
        self.by_path.contains_key(dir)
    }

    pub fn roots(&self) -> impl Iterator<Item = &Path> {
        self.roots.iter().map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    pub fn follows_links(&self) -> bool {
        self.follow_links
    }

    /// Release every key. Used at shutdown.
    pub fn clear(&mut self) -> usize {
        let all: Vec<PathBuf> = self.by_path.keys().cloned().collect();
        let count = all.iter().filter_map(|p| self.release(p)).count();
        self.roots.clear();
        self.removed.clear();
        count
    }

    fn release(&mut self, dir: &Path) -> Option<WatchKey> {
        let key = self.by_path.remove(dir)?;
        self.by_key.remove(&key.id());
        key.cancel();

        // The OS drops watches of deleted directories on its own.
        if let Err(e) = self.backend.unwatch(dir) {
            crate::debug_event!("registry", "unwatch", "{}: {e}", dir.display());
        }
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn registry() -> WatchRegistry<notify::RecommendedWatcher> {
        let backend = notify::recommended_watcher(|_: notify::Result<notify::Event>| {}).unwrap();
        WatchRegistry::new(backend, KeySignals::new(16), false)
    }

    /// root/{a/{c}, b}, plus a few files.
    fn tree() -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let root = fs::canonicalize(temp_dir.path()).unwrap();
        fs::create_dir_all(root.join("a").join("c")).unwrap();
        fs::create_dir(root.join("b")).unwrap();
        fs::write(root.join("a").join("f1.txt"), "f1").unwrap();
        fs::write(root.join("b").join("g1.txt"), "g1").unwrap();
        fs::write(root.join("b").join("g2.txt"), "g2").unwrap();
        (temp_dir, root)
    }

    #[test]
    fn test_register_tree_covers_every_directory() {
        let (_temp_dir, root) = tree();
        let mut registry = registry();

        let report = registry.register_tree(&root).unwrap();

        assert_eq!(report.root, root);
        assert_eq!(report.registered.len(), 4);
        assert!(report.failures.is_empty());
        assert_eq!(registry.len(), 4);
        for dir in [
            root.clone(),
            root.join("a"),
            root.join("a").join("c"),
            root.join("b"),
        ] {
            assert!(registry.contains(&dir), "{} not watched", dir.display());
        }
        // Files are never registered.
        assert!(!registry.contains(&root.join("b").join("g1.txt")));
        assert_eq!(registry.roots().collect::<Vec<_>>(), vec![root.as_path()]);
    }

    #[test]
    fn test_register_tree_is_idempotent() {
        let (_temp_dir, root) = tree();
        let mut registry = registry();

        registry.register_tree(&root).unwrap();
        let again = registry.register_tree(&root).unwrap();
        assert!(again.registered.is_empty());

        // A nested root is already covered.
        let nested = registry.register_tree(&root.join("a")).unwrap();
        assert!(nested.registered.is_empty());
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_register_tree_rejects_missing_and_files() {
        let (_temp_dir, root) = tree();
        let mut registry = registry();

        let err = registry.register_tree(&root.join("missing")).unwrap_err();
        assert!(err.is_not_found());

        let err = registry.register_tree(&root.join("b").join("g1.txt")).unwrap_err();
        assert!(matches!(err, WatchError::NotADirectory { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_bidirectional_lookup() {
        let (_temp_dir, root) = tree();
        let mut registry = registry();
        registry.register_tree(&root).unwrap();

        let b = root.join("b");
        let key = registry.key_for_path(&b).unwrap().clone();
        assert_eq!(key.path(), b.as_path());
        assert_eq!(registry.path_for_key(key.id()), Some(b.as_path()));
    }

    #[test]
    fn test_events_resolve_to_parent_key() {
        let (_temp_dir, root) = tree();
        let mut registry = registry();
        registry.register_tree(&root).unwrap();

        let key = registry.key_for_event(&root.join("b").join("g1.txt")).unwrap();
        assert_eq!(key.path(), root.join("b").as_path());

        // A watched directory is reported on its parent's key.
        let key = registry.key_for_event(&root.join("a").join("c")).unwrap();
        assert_eq!(key.path(), root.join("a").as_path());

        // The root has no watched parent and reports on itself.
        let key = registry.key_for_event(&root).unwrap();
        assert_eq!(key.path(), root.as_path());

        assert!(registry.key_for_event(Path::new("/elsewhere/file")).is_none());
    }

    #[test]
    fn test_unregister_releases_descendants() {
        let (_temp_dir, root) = tree();
        let mut registry = registry();
        registry.register_tree(&root).unwrap();
        let c_key = registry.key_for_path(&root.join("a").join("c")).unwrap().clone();

        let released = registry.unregister_path(&root.join("a"));

        assert_eq!(released.len(), 2);
        assert!(released.iter().all(|k| !k.is_valid()));
        assert!(!c_key.is_valid());
        assert!(!registry.contains(&root.join("a")));
        assert!(registry.contains(&root.join("b")));
        assert!(registry.path_for_key(c_key.id()).is_none());

        // Not registered any more: no-op.
        assert!(registry.unregister_path(&root.join("a")).is_empty());
    }

    #[test]
    fn test_removed_marker_is_consumed_once() {
        let (_temp_dir, root) = tree();
        let mut registry = registry();
        registry.register_tree(&root).unwrap();

        let b = root.join("b");
        assert_eq!(registry.unregister_removed(&b).len(), 1);
        assert!(registry.take_removed(&b));
        assert!(!registry.take_removed(&b));

        assert!(registry.unregister_removed(&root.join("nope")).is_empty());
        assert!(!registry.take_removed(&root.join("nope")));
    }

    #[test]
    fn test_expired_removed_marker_is_ignored() {
        let (_temp_dir, root) = tree();
        let mut registry = registry();
        registry.removal_grace = Duration::ZERO;
        registry.register_tree(&root).unwrap();

        let b = root.join("b");
        assert_eq!(registry.unregister_removed(&b).len(), 1);
        assert!(!registry.take_removed(&b));

        // Stale markers are pruned on the next removal.
        registry.removed.insert(root.join("gone"), Instant::now());
        registry.unregister_removed(&root.join("a"));
        assert!(!registry.removed.contains_key(&root.join("gone")));
    }

    #[test]
    fn test_clear_releases_everything() {
        let (_temp_dir, root) = tree();
        let mut registry = registry();
        registry.register_tree(&root).unwrap();
        let root_key = registry.key_for_path(&root).unwrap().clone();

        assert_eq!(registry.clear(), 4);
        assert!(registry.is_empty());
        assert!(!root_key.is_valid());
        assert_eq!(registry.roots().count(), 0);
    }
}
