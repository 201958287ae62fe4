//! Watch keys: per-directory event queues handed out as leases.
//!
//! A key is signalled (published on the signalled-keys stream) when its first
//! pending event arrives. It is not signalled again until the subscriber
//! drains it with [`WatchKey::poll_events`] and acknowledges with
//! [`WatchKey::reset`]. Events that arrive in between accumulate on the key.
//!
//! Signalled keys stay in an outstanding set until they are reset or
//! cancelled. A subscriber that lags behind the broadcast replays that set,
//! so a dropped signal never leaves a directory silent.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use super::event::{ChangeEvent, KeyId};
use super::stream::Broadcaster;

type Outstanding = Arc<Mutex<BTreeMap<KeyId, WatchKey>>>;

/// Publisher side of the signalled-keys stream.
#[derive(Clone)]
pub(crate) struct KeySignals {
    broadcaster: Broadcaster<WatchKey>,
    outstanding: Outstanding,
}

impl KeySignals {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            broadcaster: Broadcaster::new("signalled-keys", capacity),
            outstanding: Arc::default(),
        }
    }

    pub(crate) fn subscribe(&self) -> SignalledKeys {
        SignalledKeys {
            rx: self.broadcaster.subscribe(),
            outstanding: Arc::clone(&self.outstanding),
            replay: VecDeque::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn outstanding_count(&self) -> usize {
        self.outstanding.lock().len()
    }
}

/// Subscription to signalled keys.
///
/// Every subscriber sees every signal. If a subscriber falls more than the
/// configured capacity behind, the keys it missed are delivered again from
/// the set of keys still awaiting [`WatchKey::reset`]; a key may then be seen
/// twice, in which case the second [`WatchKey::poll_events`] is empty.
pub struct SignalledKeys {
    rx: broadcast::Receiver<WatchKey>,
    outstanding: Outstanding,
    replay: VecDeque<WatchKey>,
}

impl SignalledKeys {
    /// Wait for the next signalled key. `None` once the stream is closed.
    pub async fn recv(&mut self) -> Option<WatchKey> {
        loop {
            if let Some(key) = self.replay.pop_front() {
                return Some(key);
            }
            match self.rx.recv().await {
                Ok(key) => return Some(key),
                Err(RecvError::Lagged(missed)) => self.recover(missed),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Blocking variant of [`recv`](Self::recv) for plain threads.
    ///
    /// Panics if called from within an async execution context.
    pub fn blocking_recv(&mut self) -> Option<WatchKey> {
        loop {
            if let Some(key) = self.replay.pop_front() {
                return Some(key);
            }
            match self.rx.blocking_recv() {
                Ok(key) => return Some(key),
                Err(RecvError::Lagged(missed)) => self.recover(missed),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next key if one is ready, without waiting.
    pub fn try_recv(&mut self) -> Option<WatchKey> {
        loop {
            if let Some(key) = self.replay.pop_front() {
                return Some(key);
            }
            match self.rx.try_recv() {
                Ok(key) => return Some(key),
                Err(TryRecvError::Lagged(missed)) => self.recover(missed),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    fn recover(&mut self, missed: u64) {
        let outstanding: Vec<WatchKey> = self.outstanding.lock().values().cloned().collect();
        tracing::warn!(
            "[signalled-keys] subscriber lagged by {missed}, replaying {} outstanding keys",
            outstanding.len()
        );
        self.replay.extend(outstanding);
    }
}

impl fmt::Debug for SignalledKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalledKeys")
            .field("replay", &self.replay.len())
            .finish()
    }
}

#[derive(Debug, Default)]
struct KeyState {
    pending: Vec<ChangeEvent>,
    signalled: bool,
    valid: bool,
}

struct KeyInner {
    id: KeyId,
    path: PathBuf,
    state: Mutex<KeyState>,
    signals: KeySignals,
}

/// Registration of one watched directory.
///
/// Cloning is cheap; all clones refer to the same queue.
#[derive(Clone)]
pub struct WatchKey {
    inner: Arc<KeyInner>,
}

impl WatchKey {
    pub(crate) fn new(id: KeyId, path: PathBuf, signals: KeySignals) -> Self {
        Self {
            inner: Arc::new(KeyInner {
                id,
                path,
                state: Mutex::new(KeyState {
                    valid: true,
                    ..KeyState::default()
                }),
                signals,
            }),
        }
    }

    pub fn id(&self) -> KeyId {
        self.inner.id
    }

    /// Directory this key watches.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// False once the directory was deleted, unwatched, or the watcher shut down.
    pub fn is_valid(&self) -> bool {
        self.inner.state.lock().valid
    }

    /// Take every pending event, in arrival order.
    pub fn poll_events(&self) -> Vec<ChangeEvent> {
        std::mem::take(&mut self.inner.state.lock().pending)
    }

    /// Acknowledge the key so that further events signal it again.
    ///
    /// If events arrived since the last [`poll_events`](Self::poll_events),
    /// the key is signalled again immediately. Returns `false` when the key
    /// is no longer valid.
    pub fn reset(&self) -> bool {
        let resignal = {
            let mut state = self.inner.state.lock();
            if !state.valid {
                return false;
            }
            if state.pending.is_empty() {
                state.signalled = false;
                self.inner.signals.outstanding.lock().remove(&self.inner.id);
                false
            } else {
                true
            }
        };

        if resignal {
            self.inner.signals.broadcaster.send(self.clone());
        }
        true
    }

    /// Queue an event, signalling the key if it is not already signalled.
    pub(crate) fn push(&self, event: ChangeEvent) {
        let signal = {
            let mut state = self.inner.state.lock();
            if !state.valid {
                return;
            }
            state.pending.push(event);
            let signal = !std::mem::replace(&mut state.signalled, true);
            if signal {
                self.inner
                    .signals
                    .outstanding
                    .lock()
                    .insert(self.inner.id, self.clone());
            }
            signal
        };

        if signal {
            self.inner.signals.broadcaster.send(self.clone());
        }
    }

    /// Invalidate the key. Already queued events can still be polled.
    pub(crate) fn cancel(&self) {
        let mut state = self.inner.state.lock();
        state.valid = false;
        self.inner.signals.outstanding.lock().remove(&self.inner.id);
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }
}

impl PartialEq for WatchKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for WatchKey {}

impl fmt::Debug for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchKey")
            .field("id", &self.inner.id)
            .field("path", &self.inner.path)
            .finish()
    }
}
