use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use log::{debug, warn};

use crate::error::ThreatPulseError;

/// Outcome of a successful [`ScanQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Added,
    /// The path was already waiting in the queue
    AlreadyQueued,
}

/// Bounded FIFO of paths waiting for a worker.
///
/// Also tracks which paths are currently queued so that admission sweeps do
/// not pile up duplicates of the same file.
pub struct ScanQueue {
    sender: Sender<PathBuf>,
    receiver: Receiver<PathBuf>,
    queued: Mutex<HashSet<PathBuf>>,
}

impl ScanQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded::<PathBuf>(capacity.max(1));
        ScanQueue {
            sender,
            receiver,
            queued: Mutex::new(HashSet::new()),
        }
    }

    /// Puts `path` on the queue, waiting at most `timeout` for space. On timeout
    /// the file is dropped from admission and `QueueFull` is returned; its store
    /// row stays pending for a later sweep.
    pub fn enqueue(&self, path: &Path, timeout: Duration) -> Result<Enqueued, ThreatPulseError> {
        {
            let mut queued = self.queued.lock().unwrap();
            if !queued.insert(path.to_path_buf()) {
                return Ok(Enqueued::AlreadyQueued);
            }
        }

        match self.sender.send_timeout(path.to_path_buf(), timeout) {
            Ok(()) => {
                debug!("Enqueued: {}", path.display());
                Ok(Enqueued::Added)
            }
            Err(SendTimeoutError::Timeout(_)) | Err(SendTimeoutError::Disconnected(_)) => {
                self.queued.lock().unwrap().remove(path);
                warn!(
                    "Queue full ({} items): dropped {} after {:?}",
                    self.len(),
                    path.display(),
                    timeout
                );
                Err(ThreatPulseError::QueueFull(path.to_path_buf()))
            }
        }
    }

    /// Waits up to `timeout` for the next path.
    pub fn dequeue(&self, timeout: Duration) -> Option<PathBuf> {
        match self.receiver.recv_timeout(timeout) {
            Ok(path) => {
                self.queued.lock().unwrap().remove(&path);
                Some(path)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.receiver.capacity().unwrap_or(0)
    }

    pub fn is_queued(&self, path: &Path) -> bool {
        self.queued.lock().unwrap().contains(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_fifo_order() {
        let queue = ScanQueue::new(4);
        for name in ["a", "b", "c"] {
            queue.enqueue(Path::new(name), Duration::from_millis(10)).unwrap();
        }
        assert_eq!(queue.len(), 3);
        let order: Vec<PathBuf> = (0..3)
            .filter_map(|_| queue.dequeue(Duration::from_millis(10)))
            .collect();
        assert_eq!(order, vec![PathBuf::from("a"), PathBuf::from("b"), PathBuf::from("c")]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_duplicate_paths_not_queued_twice() {
        let queue = ScanQueue::new(4);
        assert_eq!(
            queue.enqueue(Path::new("a"), Duration::from_millis(10)).unwrap(),
            Enqueued::Added
        );
        assert_eq!(
            queue.enqueue(Path::new("a"), Duration::from_millis(10)).unwrap(),
            Enqueued::AlreadyQueued
        );
        assert_eq!(queue.len(), 1);

        queue.dequeue(Duration::from_millis(10)).unwrap();
        assert!(!queue.is_queued(Path::new("a")));
    }

    #[test]
    fn test_full_queue_fails_within_timeout() {
        let queue = ScanQueue::new(2);
        queue.enqueue(Path::new("1"), Duration::from_millis(10)).unwrap();
        queue.enqueue(Path::new("2"), Duration::from_millis(10)).unwrap();

        let started = Instant::now();
        let result = queue.enqueue(Path::new("3"), Duration::from_millis(50));
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(ThreatPulseError::QueueFull(_))));
        assert!(elapsed < Duration::from_secs(2), "enqueue blocked for {elapsed:?}");
        assert!(!queue.is_queued(Path::new("3")));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.capacity(), 2);
    }

    #[test]
    fn test_dequeue_times_out_when_empty() {
        let queue = ScanQueue::new(1);
        assert!(queue.dequeue(Duration::from_millis(20)).is_none());
    }
}
