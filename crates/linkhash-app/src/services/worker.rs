//! Chunk workers: claim a chunk, digest each record in isolation, commit.
//!
//! Two failure boundaries exist. Each record runs inside its own
//! `catch_unwind`, and any error or panic there settles only that record as
//! `Error`. Everything else in a chunk (claiming, loading the job, deriving
//! keys, committing) sits inside the chunk boundary; a failure there marks
//! every non-terminal row of the chunk `Error` and surfaces as
//! [`WorkerError::FatalChunk`], which the pool logs and moves past.

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use flume::Receiver;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{self, JoinHandle};

use crate::digest::{DigestEngine, DigestError, KeyMaterial, LinkageSchema};
use crate::services::dispatcher::ChunkTask;
use crate::services::jobs::{JobStore, JobStoreError};
use crate::services::records::{ClaimedRecord, RecordOutcome};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error("chunk {job_id}[{start}, {end}) failed ({failed} rows marked error): {message}")]
    FatalChunk {
        job_id: String,
        start: u64,
        end: u64,
        failed: u64,
        message: String,
    },
}

#[derive(Debug, Error)]
enum ChunkFailure {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Digest(#[from] DigestError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkReport {
    pub claimed: u64,
    pub done: u64,
    pub invalid: u64,
    pub errored: u64,
    /// Outcomes discarded because their row was deleted mid-flight.
    pub dropped: u64,
    /// The owning job no longer exists; nothing was processed.
    pub job_missing: bool,
}

impl ChunkReport {
    fn job_missing() -> Self {
        Self {
            job_missing: true,
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct Worker {
    store: Arc<JobStore>,
    engine: Arc<dyn DigestEngine>,
}

impl Worker {
    pub fn new(store: Arc<JobStore>, engine: Arc<dyn DigestEngine>) -> Self {
        Self { store, engine }
    }

    /// Process one chunk task to completion on the current thread.
    pub fn process_chunk(&self, task: &ChunkTask) -> Result<ChunkReport, WorkerError> {
        debug_assert!(task.range.start <= task.range.end);
        let claimed_from = Cell::new(None);
        let attempt =
            panic::catch_unwind(AssertUnwindSafe(|| self.run_chunk(task, &claimed_from)));
        let message = match attempt {
            Ok(Ok(report)) => return Ok(report),
            Ok(Err(failure)) => failure.to_string(),
            Err(payload) => format!("chunk processing panicked: {}", panic_message(&*payload)),
        };

        let failed =
            self.store
                .fail_range(&task.job_id, claimed_from.get(), task.range, &message)?;
        tracing::error!(
            job_id = %task.job_id,
            chunk_start = task.range.start,
            chunk_end = task.range.end,
            failed,
            error = %message,
            "fatal chunk failure"
        );
        Err(WorkerError::FatalChunk {
            job_id: task.job_id.clone(),
            start: task.range.start,
            end: task.range.end,
            failed,
            message,
        })
    }

    /// `claimed_from` receives the job incarnation as soon as rows are
    /// claimed, so a failure afterwards only touches that incarnation.
    fn run_chunk(
        &self,
        task: &ChunkTask,
        claimed_from: &Cell<Option<u64>>,
    ) -> Result<ChunkReport, ChunkFailure> {
        let Some(chunk) = self.store.claim_chunk(&task.job_id, task.range)? else {
            tracing::debug!(job_id = %task.job_id, "job deleted before chunk start");
            return Ok(ChunkReport::job_missing());
        };
        claimed_from.set(Some(chunk.incarnation));
        let claimed = chunk.records;
        let mut report = ChunkReport {
            claimed: claimed.len() as u64,
            ..ChunkReport::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }

        let job = match self.store.get_job(&task.job_id)? {
            Some(job) if job.incarnation == chunk.incarnation => job,
            _ => {
                tracing::debug!(job_id = %task.job_id, "job deleted while chunk was claimed");
                return Ok(ChunkReport::job_missing());
            }
        };
        let schema = LinkageSchema::from_json_str(&job.schema_json)?;
        self.engine.check_schema(&schema)?;
        let keys = self.engine.derive_keys(
            &job.secret,
            schema.field_count(),
            &schema.clk_config.kdf,
        )?;

        let mut outcomes = Vec::with_capacity(claimed.len());
        for record in claimed {
            let outcome = self.process_record(record, &schema, &keys, task.validate);
            match &outcome {
                RecordOutcome::Done { .. } => report.done += 1,
                RecordOutcome::InvalidData { .. } => report.invalid += 1,
                RecordOutcome::Error { .. } => report.errored += 1,
            }
            outcomes.push(outcome);
        }

        let commit = self
            .store
            .commit_outcomes(&task.job_id, chunk.incarnation, outcomes)?;
        report.dropped = commit.dropped;
        tracing::debug!(
            job_id = %task.job_id,
            chunk_start = task.range.start,
            chunk_end = task.range.end,
            done = report.done,
            invalid = report.invalid,
            errored = report.errored,
            dropped = report.dropped,
            "chunk committed"
        );
        Ok(report)
    }

    fn process_record(
        &self,
        record: ClaimedRecord,
        schema: &LinkageSchema,
        keys: &KeyMaterial,
        validate: bool,
    ) -> RecordOutcome {
        let index = record.index;
        let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
            if validate {
                if let Err(err) = self.engine.validate(&record.input, &schema.features) {
                    return Ok(RecordOutcome::InvalidData {
                        index,
                        message: err.to_string(),
                    });
                }
            }
            let digest = self.engine.digest(&record.input, schema, keys)?;
            Ok::<_, DigestError>(RecordOutcome::Done { index, digest })
        }));
        match attempt {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => RecordOutcome::Error {
                index,
                message: err.to_string(),
            },
            Err(payload) => RecordOutcome::Error {
                index,
                message: format!("record processing panicked: {}", panic_message(&*payload)),
            },
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic payload".to_string()
}

/// Fixed set of async slots pulling chunk tasks off the queue. Each chunk
/// runs on the blocking pool since LMDB transactions are thread-bound.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(worker: Worker, tasks: Receiver<ChunkTask>, concurrency: usize) -> Self {
        let worker = Arc::new(worker);
        let (shutdown, _) = watch::channel(false);
        let handles = (0..concurrency.max(1))
            .map(|slot| {
                let worker = Arc::clone(&worker);
                let tasks = tasks.clone();
                let stop = shutdown.subscribe();
                tokio::spawn(run_slot(slot, worker, tasks, stop))
            })
            .collect();
        tracing::info!(concurrency = concurrency.max(1), "worker pool started");
        Self { shutdown, handles }
    }

    pub fn concurrency(&self) -> usize {
        self.handles.len()
    }

    /// Stop pulling new tasks and wait for in-flight chunks to finish.
    pub async fn shutdown(self) {
        if self.shutdown.send(true).is_err() {
            tracing::debug!("worker slots already stopped");
        }
        self.join().await;
    }

    /// Wait until every slot exits, e.g. after all queue senders are dropped.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(error) = handle.await {
                tracing::error!(%error, "worker slot terminated abnormally");
            }
        }
        tracing::info!("worker pool stopped");
    }
}

async fn run_slot(
    slot: usize,
    worker: Arc<Worker>,
    tasks: Receiver<ChunkTask>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let task = tokio::select! {
            biased;
            _ = stop.changed() => break,
            received = tasks.recv_async() => match received {
                Ok(task) => task,
                Err(_) => break,
            },
        };

        let job_id = task.job_id.clone();
        let range = task.range;
        let worker = Arc::clone(&worker);
        match task::spawn_blocking(move || worker.process_chunk(&task)).await {
            Ok(Ok(report)) => {
                tracing::debug!(slot, job_id = %job_id, chunk_start = range.start, ?report, "chunk finished");
            }
            Ok(Err(WorkerError::FatalChunk { .. })) => {
                // Already logged with details by the worker; keep pulling.
            }
            Ok(Err(error)) => {
                tracing::error!(slot, job_id = %job_id, chunk_start = range.start, %error, "chunk store failure");
            }
            Err(error) => {
                tracing::error!(slot, job_id = %job_id, chunk_start = range.start, %error, "chunk task aborted");
            }
        }
    }
    tracing::debug!(slot, "worker slot exiting");
}
