//! Run-length compression of a job's `(index, status)` sequence.

use linkhash_server::{RecordStatus, StatusRange};

use crate::services::jobs::{JobStore, JobStoreError};

/// Incremental compressor fed with pairs in ascending index order.
///
/// Adjacent pairs share a range iff their statuses match and their indices
/// are consecutive, so gaps left by deletions always split a run.
#[derive(Debug, Default)]
pub struct StatusCompressor {
    ranges: Vec<StatusRange>,
    current: Option<StatusRange>,
}

impl StatusCompressor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, index: u64, status: RecordStatus) {
        if let Some(run) = self.current.as_mut() {
            debug_assert!(index >= run.end, "indices must arrive in ascending order");
            if run.status == status && run.end == index {
                run.end = index + 1;
                return;
            }
        }
        let next = StatusRange {
            status,
            start: index,
            end: index + 1,
        };
        if let Some(done) = self.current.replace(next) {
            self.ranges.push(done);
        }
    }

    pub fn finish(mut self) -> Vec<StatusRange> {
        if let Some(done) = self.current.take() {
            self.ranges.push(done);
        }
        self.ranges
    }
}

pub fn compress_statuses<I>(pairs: I) -> Vec<StatusRange>
where
    I: IntoIterator<Item = (u64, RecordStatus)>,
{
    let mut compressor = StatusCompressor::new();
    for (index, status) in pairs {
        compressor.push(index, status);
    }
    compressor.finish()
}

impl JobStore {
    /// Status runs for a job in one ordered pass over its rows.
    pub fn status_ranges(&self, job_id: &str) -> Result<Vec<StatusRange>, JobStoreError> {
        let mut compressor = StatusCompressor::new();
        self.for_each_status(job_id, |index, status| compressor.push(index, status))?;
        Ok(compressor.finish())
    }
}
