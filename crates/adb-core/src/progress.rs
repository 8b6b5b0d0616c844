//! Ordered progress sink with push-style notification.
//!
//! One writer appends records; any number of observers read snapshots or await new records.
//! Appending never waits on observers.

use std::sync::{Arc, RwLock};
use tokio::sync::watch;

use crate::ignore_poison::IgnorePoisonRw;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct SinkState {
    len: usize,
    closed: bool,
}

struct Inner<T> {
    items: RwLock<Vec<T>>,
    state: watch::Sender<SinkState>,
}

/// Shared, append-only record of progress updates. Cloning yields another handle to the
/// same sink.
pub struct ProgressSink<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ProgressSink<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for ProgressSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for ProgressSink<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = *self.inner.state.borrow();
        f.debug_struct("ProgressSink")
            .field("len", &state.len)
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T> ProgressSink<T> {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SinkState::default());
        Self {
            inner: Arc::new(Inner {
                items: RwLock::new(Vec::new()),
                state,
            }),
        }
    }

    /// Appends a record and wakes observers. Ignored once the sink is closed.
    pub fn push(&self, item: T) {
        let len = {
            let mut items = self.inner.items.write_ignore_poison();
            if self.inner.state.borrow().closed {
                return;
            }
            items.push(item);
            items.len()
        };
        self.inner.state.send_modify(|state| state.len = len);
    }

    /// Marks the sink as complete. Subscriptions end after delivering what's left.
    pub fn close(&self) {
        self.inner.state.send_modify(|state| state.closed = true);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.borrow().closed
    }

    pub fn len(&self) -> usize {
        self.inner.items.read_ignore_poison().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for new records, starting from the first one ever pushed.
    pub fn subscribe(&self) -> ProgressSubscription<T> {
        ProgressSubscription {
            sink: self.clone(),
            rx: self.inner.state.subscribe(),
            offset: 0,
        }
    }
}

impl<T: Clone> ProgressSink<T> {
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.items.read_ignore_poison().clone()
    }

    /// Records from `offset` on, for observers that keep their own cursor.
    pub fn since(&self, offset: usize) -> Vec<T> {
        let items = self.inner.items.read_ignore_poison();
        items.get(offset..).map(<[T]>::to_vec).unwrap_or_default()
    }

    pub fn latest(&self) -> Option<T> {
        self.inner.items.read_ignore_poison().last().cloned()
    }
}

/// Cursor over a sink that suspends until records arrive.
pub struct ProgressSubscription<T> {
    sink: ProgressSink<T>,
    rx: watch::Receiver<SinkState>,
    offset: usize,
}

impl<T: Clone> ProgressSubscription<T> {
    /// Returns every record pushed since the previous call, waiting if there are none yet.
    /// `None` once the sink is closed and fully drained.
    pub async fn next_batch(&mut self) -> Option<Vec<T>> {
        loop {
            let state = *self.rx.borrow_and_update();
            if state.len > self.offset {
                let batch = self.sink.since(self.offset);
                self.offset += batch.len();
                return Some(batch);
            }
            if state.closed {
                return None;
            }
            if self.rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Number of records delivered so far.
    pub fn position(&self) -> usize {
        self.offset
    }
}
