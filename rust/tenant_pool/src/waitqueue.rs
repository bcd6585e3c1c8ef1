use crate::time::Instant;
use std::{collections::VecDeque, time::Duration};
use tokio::sync::oneshot;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display("waiter#{_0}")]
pub struct WaiterId(u64);

/// A single queued waiter. The slot can be fulfilled exactly once.
pub struct WaitObject<T> {
    pub id: WaiterId,
    when: Instant,
    tx: oneshot::Sender<T>,
}

impl<T> WaitObject<T> {
    pub fn waited(&self) -> Duration {
        self.when.elapsed()
    }

    /// Deliver `value` to the waiter. If the waiter went away, the value is
    /// handed back.
    pub fn send(self, value: T) -> Result<(), T> {
        self.tx.send(value)
    }
}

/// Maintains a FIFO list of waiters for a given block. Unlike tokio's
/// `Notify`, each waiter receives a value and must be fulfilled or removed
/// while the owner's lock is held.
pub struct WaitQueue<T> {
    waiters: VecDeque<WaitObject<T>>,
    next_id: u64,
}

impl<T> Default for WaitQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WaitQueue<T> {
    pub fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
            next_id: 0,
        }
    }

    /// Append a waiter to the back of the queue.
    pub fn queue(&mut self) -> (WaiterId, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let id = WaiterId(self.next_id);
        self.next_id += 1;
        trace!("Queueing {id}");
        self.waiters.push_back(WaitObject {
            id,
            when: Instant::now(),
            tx,
        });
        (id, rx)
    }

    /// Take the oldest waiter.
    pub fn pop(&mut self) -> Option<WaitObject<T>> {
        self.waiters.pop_front()
    }

    /// Remove a specific waiter if it is still queued.
    pub fn remove(&mut self, id: WaiterId) -> Option<WaitObject<T>> {
        let index = self.waiters.iter().position(|waiter| waiter.id == id)?;
        self.waiters.remove(index)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// How long the oldest waiter has been waiting.
    pub fn oldest(&self) -> Duration {
        if let Some(entry) = self.waiters.front() {
            entry.when.elapsed()
        } else {
            Duration::default()
        }
    }
}
