//! Chunking of stored index ranges into worker tasks.

use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, SendTimeoutError, Sender};
use linkhash_server::IndexRange;
use thiserror::Error;

use crate::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_ENQUEUE_TIMEOUT_MS};

/// One unit of worker input: a contiguous slice of a job's index space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkTask {
    pub job_id: String,
    pub validate: bool,
    pub range: IndexRange,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("work queue is closed")]
    Closed,
    #[error("work queue stayed full for {0:?}")]
    Full(Duration),
}

/// Destination for chunk tasks. Enqueueing is not transactional with the
/// record store; callers must tolerate partial failure.
pub trait TaskQueue: Send + Sync {
    fn enqueue(&self, task: ChunkTask) -> Result<(), DispatchError>;
}

/// In-process queue backed by a bounded `flume` channel.
#[derive(Debug, Clone)]
pub struct FlumeQueue {
    sender: Sender<ChunkTask>,
    enqueue_timeout: Duration,
}

impl FlumeQueue {
    /// Create the queue and the receiving end the worker pool consumes.
    pub fn bounded(capacity: usize, enqueue_timeout: Duration) -> (Self, Receiver<ChunkTask>) {
        let (sender, receiver) = flume::bounded(capacity.max(1));
        (
            Self {
                sender,
                enqueue_timeout,
            },
            receiver,
        )
    }

    pub fn with_default_timeout(capacity: usize) -> (Self, Receiver<ChunkTask>) {
        Self::bounded(capacity, Duration::from_millis(DEFAULT_ENQUEUE_TIMEOUT_MS))
    }
}

impl TaskQueue for FlumeQueue {
    fn enqueue(&self, task: ChunkTask) -> Result<(), DispatchError> {
        self.sender
            .send_timeout(task, self.enqueue_timeout)
            .map_err(|err| match err {
                SendTimeoutError::Timeout(_) => DispatchError::Full(self.enqueue_timeout),
                SendTimeoutError::Disconnected(_) => DispatchError::Closed,
            })
    }
}

/// Split `range` into consecutive chunks of at most `chunk_size` indices.
pub fn chunk_ranges(range: IndexRange, chunk_size: u64) -> impl Iterator<Item = IndexRange> {
    debug_assert!(chunk_size > 0);
    let step = chunk_size.max(1);
    let mut cursor = range.start;
    std::iter::from_fn(move || {
        if cursor >= range.end {
            return None;
        }
        let end = cursor.saturating_add(step).min(range.end);
        let chunk = IndexRange::new(cursor, end);
        cursor = end;
        Some(chunk)
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub chunks_dispatched: u64,
    /// Chunks not enqueued; their rows remain `Queued`.
    pub chunks_failed: u64,
}

impl DispatchReport {
    pub fn merge(&mut self, other: DispatchReport) {
        self.chunks_dispatched = self.chunks_dispatched.saturating_add(other.chunks_dispatched);
        self.chunks_failed = self.chunks_failed.saturating_add(other.chunks_failed);
    }
}

#[derive(Clone, bon::Builder)]
pub struct Dispatcher {
    queue: Arc<dyn TaskQueue>,
    #[builder(default = DEFAULT_CHUNK_SIZE)]
    chunk_size: u64,
}

impl Dispatcher {
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Enqueue one task per chunk of `range`. Rows must already be stored.
    ///
    /// The first enqueue failure stops dispatch; the remaining chunks are
    /// reported as failed and can be picked up by a later re-dispatch.
    pub fn dispatch(&self, job_id: &str, validate: bool, range: IndexRange) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut chunks = chunk_ranges(range, self.chunk_size);
        while let Some(chunk) = chunks.next() {
            let task = ChunkTask {
                job_id: job_id.to_string(),
                validate,
                range: chunk,
            };
            match self.queue.enqueue(task) {
                Ok(()) => report.chunks_dispatched += 1,
                Err(error) => {
                    report.chunks_failed = 1 + chunks.by_ref().count() as u64;
                    tracing::warn!(
                        job_id,
                        chunk_start = chunk.start,
                        chunk_end = chunk.end,
                        failed = report.chunks_failed,
                        %error,
                        "dispatch stopped; remaining rows stay queued"
                    );
                    break;
                }
            }
        }
        tracing::debug!(
            job_id,
            start = range.start,
            end = range.end,
            dispatched = report.chunks_dispatched,
            "range dispatched"
        );
        report
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Accepts `capacity` tasks, then reports the queue closed.
    struct LimitedQueue {
        capacity: usize,
        accepted: Mutex<Vec<ChunkTask>>,
    }

    impl TaskQueue for LimitedQueue {
        fn enqueue(&self, task: ChunkTask) -> Result<(), DispatchError> {
            let mut accepted = self.accepted.lock().expect("queue mutex");
            if accepted.len() >= self.capacity {
                return Err(DispatchError::Closed);
            }
            accepted.push(task);
            Ok(())
        }
    }

    #[test]
    fn chunks_cover_range_without_overlap() {
        let chunks: Vec<_> = chunk_ranges(IndexRange::new(5, 2_505), 1_000).collect();
        assert_eq!(
            chunks,
            vec![
                IndexRange::new(5, 1_005),
                IndexRange::new(1_005, 2_005),
                IndexRange::new(2_005, 2_505),
            ]
        );
        assert_eq!(chunk_ranges(IndexRange::new(3, 3), 10).count(), 0);
        assert_eq!(chunk_ranges(IndexRange::new(0, 3), 1).count(), 3);
    }

    #[test]
    fn dispatch_sends_one_task_per_chunk() {
        let (queue, receiver) = FlumeQueue::with_default_timeout(16);
        let dispatcher = Dispatcher::builder()
            .queue(Arc::new(queue))
            .chunk_size(2)
            .build();
        let report = dispatcher.dispatch("job", true, IndexRange::new(0, 5));
        assert_eq!(report.chunks_dispatched, 3);
        assert_eq!(report.chunks_failed, 0);
        let tasks: Vec<_> = receiver.drain().collect();
        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().all(|t| t.validate && t.job_id == "job"));
        assert_eq!(tasks[2].range, IndexRange::new(4, 5));
    }

    #[test]
    fn partial_enqueue_failure_reports_remaining_chunks() {
        let queue = Arc::new(LimitedQueue {
            capacity: 1,
            accepted: Mutex::new(Vec::new()),
        });
        let dispatcher = Dispatcher::builder()
            .queue(queue.clone())
            .chunk_size(10)
            .build();
        let report = dispatcher.dispatch("job", false, IndexRange::new(0, 35));
        assert_eq!(report.chunks_dispatched, 1);
        assert_eq!(report.chunks_failed, 3);
        assert_eq!(queue.accepted.lock().expect("mutex").len(), 1);
    }

    #[test]
    fn closed_flume_queue_fails_enqueue() {
        let (queue, receiver) = FlumeQueue::with_default_timeout(1);
        drop(receiver);
        let task = ChunkTask {
            job_id: "job".to_string(),
            validate: false,
            range: IndexRange::new(0, 1),
        };
        assert!(matches!(queue.enqueue(task), Err(DispatchError::Closed)));
    }
}
