use std::ops::Bound;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::constants::{DEFAULT_STORE_MAP_SIZE_BYTES, MAX_JOB_ID_BYTES};
use crate::paths::{AppPaths, PathError};
use crate::services::records::{job_key_range, job_prefix};
use bincode::config;
use bincode::error::{DecodeError, EncodeError};
use bincode::serde::{decode_from_slice, encode_to_vec};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions, RoTxn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const JOBS_DB: &str = "jobs";
const RECORDS_DB: &str = "records";
const META_DB: &str = "meta";
const MAX_DBS: u32 = 4;
/// Store-wide counter behind [`Job::incarnation`].
const INCARNATION_KEY: &str = "job_incarnation";

/// A registered linkage job.
///
/// `record_count` is the allocation fence: the next free index. It only ever
/// grows, and only inside the same write transaction that stores the rows it
/// accounts for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    /// Schema descriptor as submitted (JSON text).
    pub schema_json: String,
    pub secret: Vec<u8>,
    pub record_count: u64,
    pub created_at_ms: i64,
    /// Assigned by [`JobStore::create_job`] and unique within the store, so a
    /// job recreated under a reused id never matches work claimed from the
    /// previous one.
    pub incarnation: u64,
}

impl Job {
    #[must_use]
    pub fn new(job_id: impl Into<String>, schema_json: String, secret: Vec<u8>) -> Self {
        let job_id = job_id.into();
        debug_assert!(!job_id.is_empty());
        Self {
            job_id,
            schema_json,
            secret,
            record_count: 0,
            created_at_ms: current_timestamp_ms(),
            incarnation: 0,
        }
    }
}

pub(crate) fn current_timestamp_ms() -> i64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(since_epoch.as_millis()).unwrap_or(i64::MAX)
}

/// Errors emitted by the job and record store.
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("job `{0}` already exists")]
    Duplicate(String),
    #[error("job `{0}` not found")]
    NotFound(String),
    #[error("invalid job id: {0}")]
    InvalidJobId(String),
    #[error("job `{job_id}` cannot allocate {requested} more records")]
    CounterOverflow { job_id: String, requested: u64 },
    #[error("corrupt record entry: {0}")]
    Corrupt(String),
}

/// Check that a job id can be used as a record key prefix.
pub fn validate_job_id(job_id: &str) -> Result<(), JobStoreError> {
    if job_id.is_empty() {
        return Err(JobStoreError::InvalidJobId("must not be empty".to_string()));
    }
    if job_id.len() > MAX_JOB_ID_BYTES {
        return Err(JobStoreError::InvalidJobId(format!(
            "must be at most {MAX_JOB_ID_BYTES} bytes"
        )));
    }
    if job_id.chars().any(char::is_control) {
        return Err(JobStoreError::InvalidJobId(
            "must not contain control characters".to_string(),
        ));
    }
    Ok(())
}

/// LMDB-backed persistence for jobs and their records.
#[derive(Debug)]
pub struct JobStore {
    pub(crate) env: Env,
    pub(crate) jobs: Database<Str, Bytes>,
    pub(crate) records: Database<Bytes, Bytes>,
    meta: Database<Str, Bytes>,
}

impl JobStore {
    pub fn open(paths: &AppPaths) -> Result<Self, JobStoreError> {
        Self::open_with_map_size(paths, DEFAULT_STORE_MAP_SIZE_BYTES)
    }

    pub fn open_with_map_size(paths: &AppPaths, map_size: usize) -> Result<Self, JobStoreError> {
        let path = paths.lmdb_env_dir()?;
        Self::open_at(&path, map_size)
    }

    pub fn open_at(path: &Path, map_size: usize) -> Result<Self, JobStoreError> {
        debug_assert!(path.exists());
        debug_assert!(map_size > 0);

        let mut options = EnvOpenOptions::new();
        options.max_dbs(MAX_DBS);
        options.map_size(map_size);
        let env = unsafe {
            // SAFETY: LMDB requires callers to uphold environment lifetime invariants.
            options.open(path)?
        };
        let jobs = open_or_create::<Str, Bytes>(&env, JOBS_DB)?;
        let records = open_or_create::<Bytes, Bytes>(&env, RECORDS_DB)?;
        let meta = open_or_create::<Str, Bytes>(&env, META_DB)?;
        Ok(Self {
            env,
            jobs,
            records,
            meta,
        })
    }

    /// Store a new job and return the incarnation it was given.
    pub fn create_job(&self, job: &Job) -> Result<u64, JobStoreError> {
        validate_job_id(&job.job_id)?;
        debug_assert!(job.record_count == 0);

        let mut wtxn = self.env.write_txn()?;
        if self.jobs.get(&wtxn, job.job_id.as_str())?.is_some() {
            return Err(JobStoreError::Duplicate(job.job_id.clone()));
        }
        let incarnation = self.next_incarnation(&mut wtxn)?;
        let stored = Job {
            incarnation,
            ..job.clone()
        };
        self.put_job(&mut wtxn, &stored)?;
        wtxn.commit()?;
        tracing::info!(job_id = %job.job_id, incarnation, "job created");
        Ok(incarnation)
    }

    fn next_incarnation(&self, wtxn: &mut heed::RwTxn<'_>) -> Result<u64, JobStoreError> {
        let last = match self.meta.get(wtxn, INCARNATION_KEY)? {
            Some(raw) => {
                let bytes: [u8; 8] = raw.try_into().map_err(|_| {
                    JobStoreError::Corrupt(format!("incarnation counter has {} bytes", raw.len()))
                })?;
                u64::from_be_bytes(bytes)
            }
            None => 0,
        };
        let next = last.wrapping_add(1).max(1);
        self.meta
            .put(wtxn, INCARNATION_KEY, next.to_be_bytes().as_slice())?;
        Ok(next)
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>, JobStoreError> {
        let rtxn = self.env.read_txn()?;
        self.job_in(&rtxn, job_id)
    }

    pub fn list_job_ids(&self) -> Result<Vec<String>, JobStoreError> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.jobs.iter(&rtxn)? {
            let (job_id, _) = entry?;
            out.push(job_id.to_string());
        }
        Ok(out)
    }

    /// Remove a job and every record it owns in one transaction.
    ///
    /// A concurrent batch submission either commits before this (and its
    /// rows are removed here) or observes the job as missing.
    pub fn delete_job(&self, job_id: &str) -> Result<u64, JobStoreError> {
        let mut wtxn = self.env.write_txn()?;
        if !self.jobs.delete(&mut wtxn, job_id)? {
            return Err(JobStoreError::NotFound(job_id.to_string()));
        }
        let (start, end) = job_key_range(job_id);
        let bounds = (
            Bound::Included(start.as_slice()),
            Bound::Excluded(end.as_slice()),
        );
        let removed = self.records.delete_range(&mut wtxn, &bounds)? as u64;
        wtxn.commit()?;
        tracing::info!(job_id, removed, "job deleted");
        Ok(removed)
    }

    pub(crate) fn job_in(&self, txn: &RoTxn<'_>, job_id: &str) -> Result<Option<Job>, JobStoreError> {
        match self.jobs.get(txn, job_id)? {
            Some(raw) => {
                let (job, _) = decode_from_slice::<Job, _>(raw, config::standard())?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    pub(crate) fn require_job(&self, txn: &RoTxn<'_>, job_id: &str) -> Result<Job, JobStoreError> {
        self.job_in(txn, job_id)?
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))
    }

    pub(crate) fn put_job(&self, wtxn: &mut heed::RwTxn<'_>, job: &Job) -> Result<(), JobStoreError> {
        let encoded = encode_to_vec(job, config::standard())?;
        self.jobs.put(wtxn, job.job_id.as_str(), encoded.as_slice())?;
        Ok(())
    }

    /// Number of record rows currently stored for `job_id`.
    pub fn record_rows(&self, job_id: &str) -> Result<u64, JobStoreError> {
        let rtxn = self.env.read_txn()?;
        let prefix = job_prefix(job_id);
        let mut count = 0_u64;
        for entry in self.records.prefix_iter(&rtxn, prefix.as_slice())? {
            entry?;
            count = count.saturating_add(1);
        }
        Ok(count)
    }
}

fn open_or_create<K: 'static, V: 'static>(
    env: &Env,
    name: &str,
) -> Result<Database<K, V>, heed::Error> {
    let rtxn = env.read_txn()?;
    let opened = env.open_database::<K, V>(&rtxn, Some(name))?;
    drop(rtxn);
    match opened {
        Some(existing) => Ok(existing),
        None => {
            let mut wtxn = env.write_txn()?;
            let db = env.create_database::<K, V>(&mut wtxn, Some(name))?;
            wtxn.commit()?;
            Ok(db)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, JobStore) {
        let temp = TempDir::new().expect("tempdir");
        let paths = AppPaths::new(temp.path()).expect("paths");
        let store = JobStore::open(&paths).expect("open store");
        (temp, store)
    }

    #[test]
    fn create_get_list_and_delete_job() {
        let (_temp, store) = store();
        let job = Job::new("alpha", "{}".to_string(), b"k".to_vec());
        store.create_job(&job).expect("create");

        let loaded = store.get_job("alpha").expect("get").expect("exists");
        assert_eq!(loaded.record_count, 0);
        assert_eq!(loaded.secret, b"k");
        assert_eq!(store.list_job_ids().expect("list"), vec!["alpha".to_string()]);
        assert!(loaded.incarnation > 0);

        store.delete_job("alpha").expect("delete");
        assert!(store.get_job("alpha").expect("get").is_none());
    }

    #[test]
    fn duplicate_job_is_rejected() {
        let (_temp, store) = store();
        let job = Job::new("dup", "{}".to_string(), b"k".to_vec());
        store.create_job(&job).expect("first create");
        let err = store.create_job(&job).expect_err("duplicate");
        assert!(matches!(err, JobStoreError::Duplicate(id) if id == "dup"));
    }

    #[test]
    fn deleting_missing_job_is_not_found() {
        let (_temp, store) = store();
        assert!(matches!(
            store.delete_job("ghost"),
            Err(JobStoreError::NotFound(_))
        ));
    }

    #[test]
    fn recreated_job_gets_a_new_incarnation() {
        let (_temp, store) = store();
        let job = Job::new("again", "{}".to_string(), b"k".to_vec());
        let first = store.create_job(&job).expect("first create");
        store.delete_job("again").expect("delete");
        let second = store.create_job(&job).expect("second create");
        assert_ne!(first, second);
        let loaded = store.get_job("again").expect("get").expect("exists");
        assert_eq!(loaded.incarnation, second);
    }

    #[test]
    fn job_ids_are_validated() {
        assert!(validate_job_id("ok-id").is_ok());
        assert!(validate_job_id("").is_err());
        assert!(validate_job_id("nul\0byte").is_err());
        assert!(validate_job_id(&"x".repeat(MAX_JOB_ID_BYTES + 1)).is_err());
    }
}
