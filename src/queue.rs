//! Inter-stage queues and the length probes the controller samples.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::fmt;

/// Anything whose buffered item count can be read without blocking.
pub trait Backlog: Send + Sync {
    fn backlog(&self) -> usize;
}

impl<T: Send> Backlog for Receiver<T> {
    fn backlog(&self) -> usize {
        self.len()
    }
}

/// Read-only handle on a queue's length.
///
/// Holds a receiver clone, never a sender, so it does not keep the downstream stage from seeing
/// the end of the stream.
pub struct QueueProbe {
    inner: Box<dyn Backlog>,
}

impl QueueProbe {
    pub fn new<B: Backlog + 'static>(backlog: B) -> Self {
        Self {
            inner: Box::new(backlog),
        }
    }

    /// Approximate number of buffered items; may be stale by the time it returns.
    pub fn len(&self) -> usize {
        self.inner.backlog()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for QueueProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueProbe").field("len", &self.len()).finish()
    }
}

/// Channel between stage `i` and stage `i + 1`.
pub struct StageQueue<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
}

impl<T: Send + 'static> StageQueue<T> {
    /// Bounded queue of `capacity` items, or unbounded for `None`.
    pub fn new(capacity: Option<usize>) -> Self {
        let (sender, receiver) = match capacity {
            Some(cap) => bounded(cap),
            None => unbounded(),
        };
        Self { sender, receiver }
    }

    pub fn probe(&self) -> QueueProbe {
        QueueProbe::new(self.receiver.clone())
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Hand the two ends to the producing and consuming stages.
    pub fn split(self) -> (Sender<T>, Receiver<T>) {
        (self.sender, self.receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_tracks_length() {
        let queue = StageQueue::<u64>::new(None);
        let probe = queue.probe();
        let (tx, rx) = queue.split();
        assert!(probe.is_empty());
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        assert_eq!(probe.len(), 2);
        rx.recv().unwrap();
        assert_eq!(probe.len(), 1);
    }

    #[test]
    fn probe_does_not_keep_stream_open() {
        let queue = StageQueue::<u64>::new(Some(4));
        let _probe = queue.probe();
        let (tx, rx) = queue.split();
        tx.send(7).unwrap();
        drop(tx);
        assert_eq!(rx.recv(), Ok(7));
        assert!(rx.recv().is_err());
    }
}
