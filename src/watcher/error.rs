//! Error types for the directory watcher.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from watcher operations.
///
/// Errors delivered on the errors stream are shared between subscribers as
/// `Arc<WatchError>`; errors returned from [`PendingWatch`](super::PendingWatch)
/// are owned by the caller.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Path does not exist: {path}")]
    NotFound { path: PathBuf },

    #[error("Not a directory: {path}")]
    NotADirectory { path: PathBuf },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot watch path {path}: {reason}")]
    PathWatchFailed { path: PathBuf, reason: String },

    #[error("File system event error: {details}")]
    EventError { details: String },

    #[error("Event queue overflow, changes under {path:?} may have been lost")]
    Overflow { path: Option<PathBuf> },

    #[error("Watcher closed")]
    Closed,

    #[error("Execution context rejected the watcher worker: {reason}")]
    ExecutorRejected { reason: String },

    #[error("Failed to initialize watcher: {reason}")]
    InitFailed { reason: String },

    #[error("Watcher worker failed: {reason}")]
    WorkerFailed { reason: String },
}

impl WatchError {
    /// True for the "path does not exist" condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, WatchError::NotFound { .. })
    }

    /// True when the watcher was shut down before the operation could run.
    pub fn is_closed(&self) -> bool {
        matches!(self, WatchError::Closed)
    }

    /// Path the error refers to, if any.
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            WatchError::NotFound { path }
            | WatchError::NotADirectory { path }
            | WatchError::Io { path, .. }
            | WatchError::PathWatchFailed { path, .. } => Some(path),
            WatchError::Overflow { path } => path.as_deref(),
            _ => None,
        }
    }

    /// Classify an I/O failure for `path`, keeping the not-found condition distinct.
    pub(crate) fn from_io(path: PathBuf, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            WatchError::NotFound { path }
        } else {
            WatchError::Io { path, source }
        }
    }

    /// Wrap a `notify` failure to watch a single directory.
    pub(crate) fn watch_failed(path: PathBuf, err: &notify::Error) -> Self {
        WatchError::PathWatchFailed {
            path,
            reason: err.to_string(),
        }
    }
}

impl From<notify::Error> for WatchError {
    fn from(e: notify::Error) -> Self {
        WatchError::InitFailed {
            reason: e.to_string(),
        }
    }
}

impl From<walkdir::Error> for WatchError {
    fn from(e: walkdir::Error) -> Self {
        let path = e.path().map(|p| p.to_path_buf()).unwrap_or_default();
        match e.into_io_error() {
            Some(io) => WatchError::from_io(path, io),
            None => WatchError::Io {
                path,
                source: std::io::Error::other("filesystem loop detected"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        let err = WatchError::from_io(
            PathBuf::from("/missing"),
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(err.is_not_found());
        assert_eq!(err.path(), Some(std::path::Path::new("/missing")));

        let err = WatchError::from_io(
            PathBuf::from("/locked"),
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(!err.is_not_found());
        assert!(matches!(err, WatchError::Io { .. }));
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(WatchError::Closed.to_string(), "Watcher closed");
        let err = WatchError::NotADirectory {
            path: PathBuf::from("/tmp/file.txt"),
        };
        assert_eq!(err.to_string(), "Not a directory: /tmp/file.txt");
    }
}
