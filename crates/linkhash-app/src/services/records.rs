//! Record rows: key layout, value codec and the status-changing operations
//! workers and lifecycle commands run against them.
//!
//! Keys are `job_id | 0x00 | index (u64 BE)`, so LMDB order is index order
//! within a job. Values are one status tag byte followed by a bincode body.

use std::ops::Bound;

use bincode::config;
use bincode::serde::{decode_from_slice, encode_to_vec};
use linkhash_server::{IndexRange, RecordFilter, RecordStatus, RecordView};
use serde::{Deserialize, Serialize};

use crate::services::jobs::{JobStore, JobStoreError};

const KEY_SEPARATOR: u8 = 0x00;
const INDEX_BYTES: usize = 8;

pub(crate) fn job_prefix(job_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(job_id.len() + 1);
    key.extend_from_slice(job_id.as_bytes());
    key.push(KEY_SEPARATOR);
    key
}

/// `[first key, first key past the job)` for every record of `job_id`.
pub(crate) fn job_key_range(job_id: &str) -> (Vec<u8>, Vec<u8>) {
    let start = job_prefix(job_id);
    let mut end = Vec::with_capacity(job_id.len() + 1);
    end.extend_from_slice(job_id.as_bytes());
    end.push(KEY_SEPARATOR + 1);
    (start, end)
}

pub(crate) fn record_key(job_id: &str, index: u64) -> Vec<u8> {
    let mut key = job_prefix(job_id);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

/// Key bounds for `[start, end)` within a job; `None` end means "to the end
/// of the job".
fn index_key_bounds(job_id: &str, start: u64, end: Option<u64>) -> (Vec<u8>, Vec<u8>) {
    let lower = record_key(job_id, start);
    let upper = match end {
        Some(end) => record_key(job_id, end),
        None => job_key_range(job_id).1,
    };
    (lower, upper)
}

fn decode_index(key: &[u8], prefix_len: usize) -> Result<u64, JobStoreError> {
    let tail = key.get(prefix_len..).unwrap_or_default();
    let bytes: [u8; INDEX_BYTES] = tail
        .try_into()
        .map_err(|_| JobStoreError::Corrupt(format!("record key has {} index bytes", tail.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

pub(crate) fn status_tag(status: RecordStatus) -> u8 {
    match status {
        RecordStatus::Queued => 0,
        RecordStatus::InProgress => 1,
        RecordStatus::Done => 2,
        RecordStatus::InvalidData => 3,
        RecordStatus::Error => 4,
    }
}

pub(crate) fn status_from_tag(tag: u8) -> Result<RecordStatus, JobStoreError> {
    Ok(match tag {
        0 => RecordStatus::Queued,
        1 => RecordStatus::InProgress,
        2 => RecordStatus::Done,
        3 => RecordStatus::InvalidData,
        4 => RecordStatus::Error,
        other => return Err(JobStoreError::Corrupt(format!("unknown status tag {other}"))),
    })
}

fn peek_status(value: &[u8]) -> Result<RecordStatus, JobStoreError> {
    let tag = value
        .first()
        .ok_or_else(|| JobStoreError::Corrupt("empty record value".to_string()))?;
    status_from_tag(*tag)
}

/// Payload stored after the status tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordBody {
    pub input: Option<Vec<String>>,
    pub digest: Option<Vec<u8>>,
    pub err_msg: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRow {
    pub status: RecordStatus,
    pub body: RecordBody,
}

impl RecordRow {
    pub fn queued(input: Vec<String>) -> Self {
        Self {
            status: RecordStatus::Queued,
            body: RecordBody {
                input: Some(input),
                digest: None,
                err_msg: None,
            },
        }
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, JobStoreError> {
        let body = encode_to_vec(&self.body, config::standard())?;
        let mut value = Vec::with_capacity(body.len() + 1);
        value.push(status_tag(self.status));
        value.extend_from_slice(&body);
        Ok(value)
    }

    pub(crate) fn decode(value: &[u8]) -> Result<Self, JobStoreError> {
        let status = peek_status(value)?;
        let (body, _) = decode_from_slice::<RecordBody, _>(&value[1..], config::standard())?;
        Ok(Self { status, body })
    }

    /// Terminal rows drop their input; only `Done` keeps a digest and only
    /// failures keep an error message.
    fn settle(status: RecordStatus, digest: Option<Vec<u8>>, err_msg: Option<String>) -> Self {
        debug_assert!(status.is_terminal());
        Self {
            status,
            body: RecordBody {
                input: None,
                digest: if status == RecordStatus::Done { digest } else { None },
                err_msg: if status == RecordStatus::Done { None } else { err_msg },
            },
        }
    }
}

/// A row claimed by a worker: now `InProgress`, still carrying its input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedRecord {
    pub index: u64,
    pub input: Vec<String>,
}

/// Rows claimed in one transaction, tagged with the job incarnation that
/// owned them. Later writes for these rows must quote the same incarnation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedChunk {
    pub incarnation: u64,
    pub records: Vec<ClaimedRecord>,
}

/// Final result computed for one claimed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Done { index: u64, digest: Vec<u8> },
    InvalidData { index: u64, message: String },
    Error { index: u64, message: String },
}

impl RecordOutcome {
    pub fn index(&self) -> u64 {
        match self {
            Self::Done { index, .. } | Self::InvalidData { index, .. } | Self::Error { index, .. } => {
                *index
            }
        }
    }

    fn into_row(self) -> RecordRow {
        match self {
            Self::Done { digest, .. } => RecordRow::settle(RecordStatus::Done, Some(digest), None),
            Self::InvalidData { message, .. } => {
                RecordRow::settle(RecordStatus::InvalidData, None, Some(message))
            }
            Self::Error { message, .. } => {
                RecordRow::settle(RecordStatus::Error, None, Some(message))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub written: u64,
    /// Rows deleted (or moved on) while the chunk was in flight.
    pub dropped: u64,
}

impl JobStore {
    /// Move every `Queued` row in `range` to `InProgress` and return them.
    ///
    /// Returns `None` when the job no longer exists.
    pub fn claim_chunk(
        &self,
        job_id: &str,
        range: IndexRange,
    ) -> Result<Option<ClaimedChunk>, JobStoreError> {
        let mut wtxn = self.env.write_txn()?;
        let Some(job) = self.job_in(&wtxn, job_id)? else {
            return Ok(None);
        };
        let prefix_len = job_prefix(job_id).len();
        let (lower, upper) = index_key_bounds(job_id, range.start, Some(range.end));
        let bounds = (
            Bound::Included(lower.as_slice()),
            Bound::Excluded(upper.as_slice()),
        );

        let mut claimed = Vec::new();
        for entry in self.records.range(&wtxn, &bounds)? {
            let (key, value) = entry?;
            if peek_status(value)? != RecordStatus::Queued {
                continue;
            }
            let row = RecordRow::decode(value)?;
            let index = decode_index(key, prefix_len)?;
            claimed.push(ClaimedRecord {
                index,
                input: row.body.input.unwrap_or_default(),
            });
        }

        for record in &claimed {
            let row = RecordRow {
                status: RecordStatus::InProgress,
                body: RecordBody {
                    input: Some(record.input.clone()),
                    digest: None,
                    err_msg: None,
                },
            };
            let key = record_key(job_id, record.index);
            self.records.put(&mut wtxn, &key, &row.encode()?)?;
        }
        wtxn.commit()?;
        Ok(Some(ClaimedChunk {
            incarnation: job.incarnation,
            records: claimed,
        }))
    }

    /// Persist chunk outcomes in one transaction.
    ///
    /// Rows that vanished or no longer accept the transition are skipped and
    /// counted as dropped; they never fail the commit. When the job is gone
    /// or is no longer `incarnation`, every outcome is dropped.
    pub fn commit_outcomes(
        &self,
        job_id: &str,
        incarnation: u64,
        outcomes: Vec<RecordOutcome>,
    ) -> Result<CommitReport, JobStoreError> {
        let mut report = CommitReport::default();
        if outcomes.is_empty() {
            return Ok(report);
        }
        let mut wtxn = self.env.write_txn()?;
        if !self.is_incarnation(&wtxn, job_id, incarnation)? {
            report.dropped = outcomes.len() as u64;
            tracing::debug!(
                job_id,
                incarnation,
                dropped = report.dropped,
                "stale chunk outcomes discarded"
            );
            return Ok(report);
        }
        for outcome in outcomes {
            let key = record_key(job_id, outcome.index());
            let current = match self.records.get(&wtxn, &key)? {
                Some(value) => peek_status(value)?,
                None => {
                    report.dropped = report.dropped.saturating_add(1);
                    continue;
                }
            };
            let row = outcome.into_row();
            if !current.can_transition_to(row.status) {
                report.dropped = report.dropped.saturating_add(1);
                continue;
            }
            self.records.put(&mut wtxn, &key, &row.encode()?)?;
            report.written = report.written.saturating_add(1);
        }
        wtxn.commit()?;
        if report.dropped > 0 {
            tracing::debug!(job_id, dropped = report.dropped, "skipped rows removed mid-chunk");
        }
        Ok(report)
    }

    /// Force every non-terminal row in `range` to `Error`.
    ///
    /// With `Some(incarnation)` nothing is touched unless the job still is
    /// that incarnation; `None` applies to whichever incarnation exists.
    pub fn fail_range(
        &self,
        job_id: &str,
        incarnation: Option<u64>,
        range: IndexRange,
        message: &str,
    ) -> Result<u64, JobStoreError> {
        let mut wtxn = self.env.write_txn()?;
        if let Some(incarnation) = incarnation {
            if !self.is_incarnation(&wtxn, job_id, incarnation)? {
                tracing::debug!(job_id, incarnation, "stale chunk failure ignored");
                return Ok(0);
            }
        }
        let (lower, upper) = index_key_bounds(job_id, range.start, Some(range.end));
        let bounds = (
            Bound::Included(lower.as_slice()),
            Bound::Excluded(upper.as_slice()),
        );
        let mut keys = Vec::new();
        for entry in self.records.range(&wtxn, &bounds)? {
            let (key, value) = entry?;
            if !peek_status(value)?.is_terminal() {
                keys.push(key.to_vec());
            }
        }
        let failed = RecordRow::settle(RecordStatus::Error, None, Some(message.to_string()));
        let encoded = failed.encode()?;
        for key in &keys {
            self.records.put(&mut wtxn, key, &encoded)?;
        }
        wtxn.commit()?;
        Ok(keys.len() as u64)
    }

    fn is_incarnation(
        &self,
        txn: &heed::RoTxn<'_>,
        job_id: &str,
        incarnation: u64,
    ) -> Result<bool, JobStoreError> {
        Ok(self
            .job_in(txn, job_id)?
            .is_some_and(|job| job.incarnation == incarnation))
    }

    /// Delete rows matching `filter`. The job's counter is left untouched, so
    /// deleted indices are never handed out again.
    pub fn delete_records(&self, job_id: &str, filter: &RecordFilter) -> Result<u64, JobStoreError> {
        let mut wtxn = self.env.write_txn()?;
        self.require_job(&wtxn, job_id)?;
        let start = filter.index_start.unwrap_or(0);
        if filter.index_end.is_some_and(|end| end <= start) {
            return Ok(0);
        }
        let (lower, upper) = index_key_bounds(job_id, start, filter.index_end);
        let bounds = (
            Bound::Included(lower.as_slice()),
            Bound::Excluded(upper.as_slice()),
        );

        let removed = if filter.statuses.is_empty() {
            self.records.delete_range(&mut wtxn, &bounds)? as u64
        } else {
            let mut keys = Vec::new();
            for entry in self.records.range(&wtxn, &bounds)? {
                let (key, value) = entry?;
                if filter.matches_status(peek_status(value)?) {
                    keys.push(key.to_vec());
                }
            }
            for key in &keys {
                self.records.delete(&mut wtxn, key)?;
            }
            keys.len() as u64
        };
        wtxn.commit()?;
        tracing::info!(job_id, removed, "records deleted");
        Ok(removed)
    }

    /// Hand `InProgress` rows back to the queue, e.g. after a worker crash.
    pub fn requeue_in_progress(&self, job_id: &str) -> Result<u64, JobStoreError> {
        let mut wtxn = self.env.write_txn()?;
        self.require_job(&wtxn, job_id)?;
        let prefix = job_prefix(job_id);
        let mut stranded = Vec::new();
        for entry in self.records.prefix_iter(&wtxn, prefix.as_slice())? {
            let (key, value) = entry?;
            if peek_status(value)? == RecordStatus::InProgress {
                stranded.push((key.to_vec(), RecordRow::decode(value)?));
            }
        }
        for (key, mut row) in stranded.iter().cloned() {
            row.status = RecordStatus::Queued;
            self.records.put(&mut wtxn, &key, &row.encode()?)?;
        }
        wtxn.commit()?;
        Ok(stranded.len() as u64)
    }

    /// Walk `(index, status)` pairs of a job in index order, reading only the
    /// tag byte of each value.
    pub fn for_each_status<F>(&self, job_id: &str, mut visit: F) -> Result<(), JobStoreError>
    where
        F: FnMut(u64, RecordStatus),
    {
        let rtxn = self.env.read_txn()?;
        self.require_job(&rtxn, job_id)?;
        let prefix = job_prefix(job_id);
        for entry in self.records.prefix_iter(&rtxn, prefix.as_slice())? {
            let (key, value) = entry?;
            visit(decode_index(key, prefix.len())?, peek_status(value)?);
        }
        Ok(())
    }

    /// Up to `fetch` records with `index >= lower` (and `< upper`), whose
    /// status passes `filter`, in index order.
    pub fn scan_records(
        &self,
        job_id: &str,
        lower: u64,
        upper: Option<u64>,
        filter: &RecordFilter,
        fetch: usize,
    ) -> Result<Vec<RecordView>, JobStoreError> {
        let rtxn = self.env.read_txn()?;
        self.require_job(&rtxn, job_id)?;
        let mut out = Vec::new();
        if fetch == 0 || upper.is_some_and(|upper| upper <= lower) {
            return Ok(out);
        }
        let prefix_len = job_prefix(job_id).len();
        let (lower_key, upper_key) = index_key_bounds(job_id, lower, upper);
        let bounds = (
            Bound::Included(lower_key.as_slice()),
            Bound::Excluded(upper_key.as_slice()),
        );
        for entry in self.records.range(&rtxn, &bounds)? {
            let (key, value) = entry?;
            if !filter.matches_status(peek_status(value)?) {
                continue;
            }
            let row = RecordRow::decode(value)?;
            out.push(RecordView {
                index: decode_index(key, prefix_len)?,
                status: row.status,
                err_msg: row.body.err_msg,
                digest: row.body.digest,
            });
            if out.len() >= fetch {
                break;
            }
        }
        Ok(out)
    }

    pub fn get_record(&self, job_id: &str, index: u64) -> Result<Option<RecordRow>, JobStoreError> {
        let rtxn = self.env.read_txn()?;
        match self.records.get(&rtxn, &record_key(job_id, index))? {
            Some(value) => Ok(Some(RecordRow::decode(value)?)),
            None => Ok(None),
        }
    }
}
