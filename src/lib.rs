pub mod config;
pub mod logging;
pub mod watcher;

pub use config::Settings;
pub use watcher::{
    ChangeEvent, ChangeKind, DirectoryWatcher, Executor, KeyId, PendingWatch, SignalledKeys,
    ThreadExecutor, WatchError, WatchKey, WatcherState,
};
