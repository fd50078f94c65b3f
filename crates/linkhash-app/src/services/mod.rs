//! Orchestration layer for the record-processing coordinator.
//!
//! The store modules (`jobs`, `records`, `allocator`, `status`,
//! `pagination`) own every LMDB transaction. `dispatcher` and `worker` move
//! chunk tasks between them, and `coordinator` exposes the client operations.

pub mod allocator;
pub mod coordinator;
pub mod dispatcher;
pub mod ingest;
pub mod jobs;
pub mod pagination;
pub mod records;
pub mod status;
pub mod worker;

pub use coordinator::{LinkageService, ServiceError};
pub use dispatcher::{
    ChunkTask, DispatchError, DispatchReport, Dispatcher, FlumeQueue, TaskQueue, chunk_ranges,
};
pub use ingest::{IngestError, parse_csv_batch};
pub use jobs::{Job, JobStore, JobStoreError, validate_job_id};
pub use pagination::{PageError, PageRequest};
pub use records::{ClaimedChunk, ClaimedRecord, CommitReport, RecordBody, RecordOutcome, RecordRow};
pub use status::{StatusCompressor, compress_statuses};
pub use worker::{ChunkReport, Worker, WorkerError, WorkerPool};
