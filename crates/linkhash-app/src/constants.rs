//! Cross-cutting application constants.

/// Largest number of records carried by a single chunk task.
pub const DEFAULT_CHUNK_SIZE: u64 = 1_000;

/// Number of concurrent chunk workers started by `serve`.
pub const DEFAULT_WORKER_CONCURRENCY: usize = 4;

/// Capacity of the in-process chunk queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_024;

/// How long a dispatcher waits on a full queue before giving up on a chunk.
pub const DEFAULT_ENQUEUE_TIMEOUT_MS: u64 = 5_000;

/// LMDB map size for the job/record environment (1 GiB).
pub const DEFAULT_STORE_MAP_SIZE_BYTES: usize = 1 << 30;

/// Job ids double as key prefixes and are bounded accordingly.
pub const MAX_JOB_ID_BYTES: usize = 128;
