//! Index allocation: the job counter is bumped and the batch rows are stored
//! in a single LMDB write transaction.
//!
//! LMDB admits one writer at a time, so concurrent submissions to the same
//! job are serialised on the counter and always receive disjoint ranges. A
//! job deleted concurrently is either gone before the transaction starts
//! (`NotFound`, nothing written) or deleted after it commits (the cascade in
//! [`JobStore::delete_job`] removes the rows). No partial batch is visible.

use linkhash_server::IndexRange;

use crate::services::jobs::{JobStore, JobStoreError};
use crate::services::records::{RecordRow, record_key};

impl JobStore {
    /// Reserve `rows.len()` consecutive indices for `job_id` and store the
    /// rows as `Queued` under them.
    pub fn reserve_and_insert(
        &self,
        job_id: &str,
        rows: Vec<Vec<String>>,
    ) -> Result<IndexRange, JobStoreError> {
        let requested = rows.len() as u64;
        let mut wtxn = self.env.write_txn()?;
        let mut job = self.require_job(&wtxn, job_id)?;

        let start = job.record_count;
        let end = start
            .checked_add(requested)
            .ok_or_else(|| JobStoreError::CounterOverflow {
                job_id: job_id.to_string(),
                requested,
            })?;

        for (offset, input) in rows.into_iter().enumerate() {
            let key = record_key(job_id, start + offset as u64);
            let value = RecordRow::queued(input).encode()?;
            self.records.put(&mut wtxn, &key, &value)?;
        }
        job.record_count = end;
        self.put_job(&mut wtxn, &job)?;
        wtxn.commit()?;

        debug_assert!(end >= start);
        tracing::debug!(job_id, start, end, "index range reserved");
        Ok(IndexRange::new(start, end))
    }
}
