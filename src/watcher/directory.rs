//! Directory watcher: client handle plus the dispatcher worker.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};

use crossbeam_channel::{Receiver, Sender};
use notify::Event;
use tokio::sync::{broadcast, oneshot};

use crate::config::WatcherConfig;

use super::error::WatchError;
use super::event::{ChangeEvent, ChangeKind, RenameTracker, classify};
use super::executor::{Executor, ThreadExecutor};
use super::key::{KeySignals, SignalledKeys};
use super::registry::WatchRegistry;
use super::stream::Broadcaster;

/// Lifecycle of a [`DirectoryWatcher`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WatcherState {
    /// Worker running, nothing watched yet.
    Created = 0,
    /// At least one root registered.
    Watching = 1,
    /// Terminal.
    Shutdown = 2,
}

impl WatcherState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WatcherState::Created,
            1 => WatcherState::Watching,
            _ => WatcherState::Shutdown,
        }
    }
}

type Reply = oneshot::Sender<Result<(), WatchError>>;

enum Command {
    Watch { root: PathBuf, reply: Reply },
    WatchOrStreamError { root: PathBuf },
    Unwatch { dir: PathBuf, reply: Reply },
    Shutdown { done: Sender<()> },
}

/// State shared between the client handle and the worker.
struct Shared {
    state: AtomicU8,
    signals: KeySignals,
    errors: Broadcaster<Arc<WatchError>>,
}

impl Shared {
    fn state(&self) -> WatcherState {
        WatcherState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `Shutdown`, returning the previous state.
    fn close(&self) -> WatcherState {
        WatcherState::from_u8(
            self.state
                .swap(WatcherState::Shutdown as u8, Ordering::AcqRel),
        )
    }

    fn mark_watching(&self) {
        let _ = self.state.compare_exchange(
            WatcherState::Created as u8,
            WatcherState::Watching as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn publish_error(&self, error: WatchError) {
        tracing::warn!("[watcher] {error}");
        self.errors.send(Arc::new(error));
    }
}

/// Result of a [`DirectoryWatcher::watch`] or [`DirectoryWatcher::unwatch`] request.
///
/// Await it from async code, or call [`wait`](Self::wait) from a plain thread.
#[must_use = "the request outcome is only observable through this handle"]
pub struct PendingWatch {
    path: PathBuf,
    rx: oneshot::Receiver<Result<(), WatchError>>,
}

impl PendingWatch {
    fn new(path: PathBuf) -> (Reply, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { path, rx })
    }

    fn failed(path: PathBuf, error: WatchError) -> Self {
        let (tx, pending) = Self::new(path);
        let _ = tx.send(Err(error));
        pending
    }

    /// Path the request was made for, as given by the caller.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block the current thread until the worker answers.
    ///
    /// Panics if called from within an async execution context; `.await` the
    /// request there instead.
    pub fn wait(self) -> Result<(), WatchError> {
        self.rx.blocking_recv().unwrap_or(Err(WatchError::Closed))
    }
}

impl Future for PendingWatch {
    type Output = Result<(), WatchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|reply| reply.unwrap_or(Err(WatchError::Closed)))
    }
}

impl fmt::Debug for PendingWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingWatch").field("path", &self.path).finish()
    }
}

/// Recursive directory watcher.
///
/// One background worker owns the watch registry and the OS watch backend.
/// Client calls are queued to the worker, so the registry is only ever
/// touched from that thread. Dropping the watcher shuts it down.
///
/// ```no_run
/// use treewatch::{DirectoryWatcher, ThreadExecutor};
///
/// let watcher = DirectoryWatcher::create(&ThreadExecutor::new())?;
/// let mut keys = watcher.signalled_keys();
/// watcher.watch("/tmp/project").wait()?;
///
/// while let Some(key) = keys.blocking_recv() {
///     for event in key.poll_events() {
///         println!("{} {}", event.kind(), event.path().display());
///     }
///     key.reset();
/// }
/// # Ok::<(), treewatch::WatchError>(())
/// ```
pub struct DirectoryWatcher {
    shared: Arc<Shared>,
    commands: Sender<Command>,
}

impl DirectoryWatcher {
    /// Create a watcher whose worker runs on `executor`, with default settings.
    pub fn create<E: Executor + ?Sized>(executor: &E) -> Result<Self, WatchError> {
        Self::create_with_config(executor, &WatcherConfig::default())
    }

    /// Create a watcher whose worker runs on `executor`.
    pub fn create_with_config<E: Executor + ?Sized>(
        executor: &E,
        config: &WatcherConfig,
    ) -> Result<Self, WatchError> {
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let backend = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = event_tx.send(res);
        })?;

        Self::start(executor, config, backend, event_rx)
    }

    /// Create a watcher on a dedicated thread named after `config.worker_name`.
    pub fn spawn(config: &WatcherConfig) -> Result<Self, WatchError> {
        Self::create_with_config(&ThreadExecutor::named(config.worker_name.clone()), config)
    }

    fn start<E, W>(
        executor: &E,
        config: &WatcherConfig,
        backend: W,
        events: Receiver<notify::Result<Event>>,
    ) -> Result<Self, WatchError>
    where
        E: Executor + ?Sized,
        W: notify::Watcher + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(WatcherState::Created as u8),
            signals: KeySignals::new(config.signal_capacity),
            errors: Broadcaster::new("errors", config.error_capacity),
        });

        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let worker = Dispatcher {
            registry: WatchRegistry::new(backend, shared.signals.clone(), config.follow_links),
            renames: RenameTracker::default(),
            events,
            commands: command_rx,
            shared: Arc::clone(&shared),
        };

        executor
            .execute(Box::new(move || worker.run()))
            .map_err(|e| WatchError::ExecutorRejected {
                reason: e.to_string(),
            })?;

        crate::debug_event!("watcher", "created");
        Ok(Self {
            shared,
            commands: command_tx,
        })
    }

    /// Watch `path` and every directory beneath it.
    ///
    /// Completes once the existing subtree is registered. Fails with
    /// `NotFound` / `NotADirectory` for bad roots and with `Closed` after
    /// shutdown.
    pub fn watch(&self, path: impl AsRef<Path>) -> PendingWatch {
        let path = path.as_ref().to_path_buf();
        if self.is_shutdown() {
            return PendingWatch::failed(path, WatchError::Closed);
        }

        let (reply, pending) = PendingWatch::new(path.clone());
        match self.commands.send(Command::Watch { root: path, reply }) {
            Ok(()) => pending,
            Err(crossbeam_channel::SendError(command)) => {
                if let Command::Watch { reply, .. } = command {
                    let _ = reply.send(Err(WatchError::Closed));
                }
                pending
            }
        }
    }

    /// Watch `path`, reporting any failure on the errors stream instead of to the caller.
    pub fn watch_or_stream_error(&self, path: impl AsRef<Path>) {
        let root = path.as_ref().to_path_buf();
        if self.is_shutdown()
            || self
                .commands
                .send(Command::WatchOrStreamError { root })
                .is_err()
        {
            self.shared.publish_error(WatchError::Closed);
        }
    }

    /// Stop watching `path` and every directory beneath it.
    ///
    /// Succeeds without effect if `path` is not watched.
    pub fn unwatch(&self, path: impl AsRef<Path>) -> PendingWatch {
        let path = path.as_ref().to_path_buf();
        if self.is_shutdown() {
            return PendingWatch::failed(path, WatchError::Closed);
        }

        let (reply, pending) = PendingWatch::new(path.clone());
        if let Err(crossbeam_channel::SendError(Command::Unwatch { reply, .. })) =
            self.commands.send(Command::Unwatch { dir: path, reply })
        {
            let _ = reply.send(Err(WatchError::Closed));
        }
        pending
    }

    /// Subscribe to keys signalled from now on.
    ///
    /// Each received key must be drained with
    /// [`WatchKey::poll_events`](super::WatchKey::poll_events) and acknowledged
    /// with [`WatchKey::reset`](super::WatchKey::reset) before it can be
    /// signalled again.
    pub fn signalled_keys(&self) -> SignalledKeys {
        self.shared.signals.subscribe()
    }

    /// Subscribe to non-fatal watch failures and the terminal worker failure.
    pub fn errors(&self) -> broadcast::Receiver<Arc<WatchError>> {
        self.shared.errors.subscribe()
    }

    pub fn state(&self) -> WatcherState {
        self.shared.state()
    }

    pub fn is_shutdown(&self) -> bool {
        self.state() == WatcherState::Shutdown
    }

    /// Stop the worker and release every watch. Idempotent.
    ///
    /// Blocks until the worker has released its watches. Requests still
    /// queued fail with `Closed`.
    pub fn shutdown(&self) {
        if self.shared.close() == WatcherState::Shutdown {
            return;
        }

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        if self.commands.send(Command::Shutdown { done: done_tx }).is_ok() {
            // Err means the worker is already gone.
            let _ = done_rx.recv();
        }
        crate::log_event!("watcher", "shutdown");
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for DirectoryWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryWatcher")
            .field("state", &self.state())
            .finish()
    }
}

enum LoopExit {
    Shutdown(Option<Sender<()>>),
    Failed(WatchError),
}

/// The background worker. Owns the registry and the OS backend.
struct Dispatcher<W> {
    registry: WatchRegistry<W>,
    renames: RenameTracker,
    events: Receiver<notify::Result<Event>>,
    commands: Receiver<Command>,
    shared: Arc<Shared>,
}

impl<W: notify::Watcher> Dispatcher<W> {
    fn run(mut self) {
        crate::debug_event!("dispatcher", "started");

        let (done, mut failure) =
            match panic::catch_unwind(AssertUnwindSafe(|| self.event_loop())) {
                Ok(LoopExit::Shutdown(done)) => (done, None),
                Ok(LoopExit::Failed(error)) => (None, Some(error)),
                Err(payload) => (
                    None,
                    Some(WatchError::WorkerFailed {
                        reason: panic_message(payload.as_ref()),
                    }),
                ),
            };

        // Keys are cancelled even when the loop died halfway through an event.
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.teardown())) {
            self.shared.close();
            failure.get_or_insert(WatchError::WorkerFailed {
                reason: panic_message(payload.as_ref()),
            });
        }

        if let Some(done) = done {
            let _ = done.send(());
        }
        if let Some(error) = failure {
            tracing::error!("[dispatcher] terminated: {error}");
            self.shared.errors.send(Arc::new(error));
        }
        crate::debug_event!("dispatcher", "stopped");
    }

    /// Wait for the next command or notification batch until shutdown.
    fn event_loop(&mut self) -> LoopExit {
        let commands = self.commands.clone();
        let events = self.events.clone();

        loop {
            crossbeam_channel::select! {
                recv(commands) -> command => match command {
                    Ok(Command::Shutdown { done }) => return LoopExit::Shutdown(Some(done)),
                    Ok(command) => self.handle_command(command),
                    // Every client handle is gone.
                    Err(_) => return LoopExit::Shutdown(None),
                },
                recv(events) -> batch => match batch {
                    Ok(Ok(event)) => self.handle_event(event),
                    Ok(Err(e)) => self.shared.publish_error(WatchError::EventError {
                        details: e.to_string(),
                    }),
                    Err(_) => {
                        return LoopExit::Failed(WatchError::WorkerFailed {
                            reason: "file system event source disconnected".to_string(),
                        });
                    }
                },
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Watch { root, reply } => {
                let _ = reply.send(self.watch_tree(&root));
            }
            Command::WatchOrStreamError { root } => {
                if let Err(e) = self.watch_tree(&root) {
                    self.shared.publish_error(e);
                }
            }
            Command::Unwatch { dir, reply } => {
                let dir = std::fs::canonicalize(&dir).unwrap_or(dir);
                let released = self.registry.unregister_path(&dir);
                if !released.is_empty() {
                    crate::log_event!(
                        "watcher",
                        "unwatched",
                        "{} directories under {}",
                        released.len(),
                        dir.display()
                    );
                }
                let _ = reply.send(Ok(()));
            }
            Command::Shutdown { .. } => unreachable!("handled by the event loop"),
        }
    }

    fn watch_tree(&mut self, root: &Path) -> Result<(), WatchError> {
        let report = self.registry.register_tree(root)?;
        self.shared.mark_watching();

        crate::log_event!(
            "watcher",
            "watching",
            "{} new directories under {} ({} watched, {} roots)",
            report.registered.len(),
            report.root.display(),
            self.registry.len(),
            self.registry.roots().count()
        );
        for failure in report.failures {
            self.shared.publish_error(failure);
        }
        Ok(())
    }

    fn handle_event(&mut self, event: Event) {
        if event.need_rescan() {
            self.shared.publish_error(WatchError::Overflow {
                path: event.paths.first().cloned(),
            });
        }
        if self.renames.is_repeat(&event) {
            crate::debug_event!("dispatcher", "repeated rename", "{:?}", event.paths);
            return;
        }

        for (path, kind) in classify(&event.kind, &event.paths) {
            self.dispatch(path, kind);
        }
    }

    /// Route one change to its key, keeping the registry in step with the tree.
    fn dispatch(&mut self, path: PathBuf, kind: ChangeKind) {
        match kind {
            ChangeKind::Created => {
                self.registry.forget_removed(&path);
                // Register before publishing so subscribers never see an unwatched directory.
                if self.is_directory(&path) && !self.registry.contains(&path) {
                    self.register_created(&path);
                }
            }
            ChangeKind::Deleted => {
                if !self.registry.contains(&path) && self.registry.take_removed(&path) {
                    crate::debug_event!("dispatcher", "duplicate removal", "{}", path.display());
                    return;
                }
            }
            ChangeKind::Modified => {}
        }

        let Some(key) = self.registry.key_for_event(&path) else {
            crate::debug_event!("dispatcher", "unmatched", "{kind} {}", path.display());
            return;
        };

        let event = ChangeEvent::new(path.clone(), kind, key.id());
        let removed_dir = kind == ChangeKind::Deleted && self.registry.contains(&path);

        // A root reports its own removal, so its key must still accept the event.
        if removed_dir && key.path() == path.as_path() {
            key.push(event);
            self.release_removed(&path);
        } else if removed_dir {
            self.release_removed(&path);
            key.push(event);
        } else {
            key.push(event);
        }
    }

    fn release_removed(&mut self, dir: &Path) {
        let released = self.registry.unregister_removed(dir);
        crate::debug_event!(
            "dispatcher",
            "directory removed",
            "{} ({} keys released)",
            dir.display(),
            released.len()
        );
    }

    fn register_created(&mut self, dir: &Path) {
        match self.registry.register_tree(dir) {
            Ok(report) => {
                crate::debug_event!(
                    "dispatcher",
                    "registered new directory",
                    "{} (+{})",
                    dir.display(),
                    report.registered.len()
                );
                for failure in report.failures {
                    self.shared.publish_error(failure);
                }
            }
            // Typically raced with a deletion.
            Err(e) => self.shared.publish_error(e),
        }
    }

    fn is_directory(&self, path: &Path) -> bool {
        let metadata = if self.registry.follows_links() {
            std::fs::metadata(path)
        } else {
            std::fs::symlink_metadata(path)
        };
        metadata.map(|m| m.is_dir()).unwrap_or(false)
    }

    /// Release everything and fail whatever is still queued.
    fn teardown(&mut self) {
        self.shared.close();
        let released = self.registry.clear();
        crate::debug_event!("dispatcher", "released", "{released} watches");

        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Watch { reply, .. } | Command::Unwatch { reply, .. } => {
                    let _ = reply.send(Err(WatchError::Closed));
                }
                Command::WatchOrStreamError { .. } => {
                    self.shared.publish_error(WatchError::Closed);
                }
                Command::Shutdown { done } => {
                    let _ = done.send(());
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}
