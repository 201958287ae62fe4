//! Recursive directory watcher.
//!
//! Watches every directory of a tree with its own non-recursive OS watch and
//! keeps the watched set in step with the tree as directories come and go.
//!
//! # Architecture
//!
//! ```text
//! DirectoryWatcher (client handle)
//!   - watch / unwatch / shutdown queued as commands
//!         |
//!         v
//! Dispatcher (single worker on a caller-supplied Executor)
//!   - notify::RecommendedWatcher, one watch per directory
//!   - WatchRegistry (path <-> key)
//!   - queues ChangeEvents on WatchKeys
//!         |
//!    +----+----------------+
//!    |                     |
//! signalled keys        errors
//! (broadcast, replayed  (broadcast)
//!  after lag)
//! ```

mod directory;
mod error;
mod event;
mod executor;
mod key;
mod registry;
mod stream;

pub use directory::{DirectoryWatcher, PendingWatch, WatcherState};
pub use error::WatchError;
pub use event::{ChangeEvent, ChangeKind, KeyId};
pub use executor::{Executor, Task, ThreadExecutor};
pub use key::{SignalledKeys, WatchKey};
pub use stream::DEFAULT_CAPACITY;
