//! Execution contexts that can host the dispatcher worker.
//!
//! The worker is one long-running blocking task. Callers choose where it
//! runs: a dedicated OS thread ([`ThreadExecutor`]) or the blocking pool of
//! an existing tokio runtime ([`tokio::runtime::Handle`]).

use std::io;
use std::sync::Arc;
use std::thread;

/// A unit of work handed to an [`Executor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run a blocking task in the background.
pub trait Executor {
    /// Start `task`. Returns an error if the context cannot accept it.
    fn execute(&self, task: Task) -> io::Result<()>;
}

/// Runs each task on a fresh, named OS thread.
#[derive(Debug, Clone)]
pub struct ThreadExecutor {
    name: String,
    stack_size: Option<usize>,
}

impl ThreadExecutor {
    pub fn new() -> Self {
        Self::named("treewatch-dispatcher")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stack_size: None,
        }
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }
}

impl Default for ThreadExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for ThreadExecutor {
    fn execute(&self, task: Task) -> io::Result<()> {
        let mut builder = thread::Builder::new().name(self.name.clone());
        if let Some(bytes) = self.stack_size {
            builder = builder.stack_size(bytes);
        }
        builder.spawn(task).map(|_| ())
    }
}

/// Runs the task on the runtime's blocking pool.
///
/// The runtime waits for blocking tasks when it is dropped, so shut the
/// watcher down before dropping the runtime.
impl Executor for tokio::runtime::Handle {
    fn execute(&self, task: Task) -> io::Result<()> {
        self.spawn_blocking(task);
        Ok(())
    }
}

impl<E: Executor + ?Sized> Executor for &E {
    fn execute(&self, task: Task) -> io::Result<()> {
        (**self).execute(task)
    }
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, task: Task) -> io::Result<()> {
        (**self).execute(task)
    }
}
