mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use linkhash_app::digest::{
    BloomDigestEngine, DigestEngine, DigestError, FieldSpec, FormatError, KdfParams, KeyMaterial,
    LinkageSchema,
};
use linkhash_app::services::{ChunkTask, JobStore, Worker, WorkerError};
use linkhash_server::{IndexRange, RecordStatus, StatusRange};

/// Wraps the real engine and injects failures on demand.
#[derive(Default)]
struct FaultyEngine {
    inner: BloomDigestEngine,
    fail_keys: bool,
    panic_on: Option<&'static str>,
}

impl DigestEngine for FaultyEngine {
    fn check_schema(&self, schema: &LinkageSchema) -> Result<(), DigestError> {
        self.inner.check_schema(schema)
    }

    fn derive_keys(
        &self,
        secret: &[u8],
        field_count: usize,
        kdf: &KdfParams,
    ) -> Result<KeyMaterial, DigestError> {
        if self.fail_keys {
            return Err(DigestError::KeyDerivation("kdf backend unavailable".to_string()));
        }
        self.inner.derive_keys(secret, field_count, kdf)
    }

    fn validate(&self, record: &[String], fields: &[FieldSpec]) -> Result<(), FormatError> {
        self.inner.validate(record, fields)
    }

    fn digest(
        &self,
        record: &[String],
        schema: &LinkageSchema,
        keys: &KeyMaterial,
    ) -> Result<Vec<u8>, DigestError> {
        if self.panic_on.is_some_and(|poison| record[0] == poison) {
            panic!("poisoned record");
        }
        self.inner.digest(record, schema, keys)
    }
}

/// Deletes and recreates the job (with a fresh batch) the first time keys are
/// derived, i.e. while the worker holds claimed rows of the old job.
struct RecreatingEngine {
    inner: BloomDigestEngine,
    store: Arc<JobStore>,
    job_id: &'static str,
    fired: AtomicBool,
}

impl DigestEngine for RecreatingEngine {
    fn check_schema(&self, schema: &LinkageSchema) -> Result<(), DigestError> {
        self.inner.check_schema(schema)
    }

    fn derive_keys(
        &self,
        secret: &[u8],
        field_count: usize,
        kdf: &KdfParams,
    ) -> Result<KeyMaterial, DigestError> {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.store.delete_job(self.job_id).expect("delete mid-chunk");
            common::insert_job(&self.store, self.job_id);
            self.store
                .reserve_and_insert(self.job_id, common::rows(2))
                .expect("refill");
            self.store
                .claim_chunk(self.job_id, IndexRange::new(0, 2))
                .expect("claim")
                .expect("recreated job");
        }
        self.inner.derive_keys(secret, field_count, kdf)
    }

    fn validate(&self, record: &[String], fields: &[FieldSpec]) -> Result<(), FormatError> {
        self.inner.validate(record, fields)
    }

    fn digest(
        &self,
        record: &[String],
        schema: &LinkageSchema,
        keys: &KeyMaterial,
    ) -> Result<Vec<u8>, DigestError> {
        self.inner.digest(record, schema, keys)
    }
}

fn task(job_id: &str, start: u64, end: u64) -> ChunkTask {
    ChunkTask {
        job_id: job_id.to_string(),
        validate: true,
        range: IndexRange::new(start, end),
    }
}

fn run(range: StatusRange) -> (RecordStatus, u64, u64) {
    (range.status, range.start, range.end)
}

#[test]
fn key_derivation_failure_fails_the_whole_chunk() {
    let (_temp, store) = common::open_store();
    common::insert_job(&store, "keys");
    store
        .reserve_and_insert("keys", common::rows(5))
        .expect("rows");

    let engine = FaultyEngine {
        fail_keys: true,
        ..FaultyEngine::default()
    };
    let worker = Worker::new(Arc::clone(&store), Arc::new(engine));
    let err = worker
        .process_chunk(&task("keys", 0, 5))
        .expect_err("chunk must fail");
    match err {
        WorkerError::FatalChunk { failed, message, .. } => {
            assert_eq!(failed, 5);
            assert!(message.contains("kdf backend unavailable"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let ranges: Vec<_> = store
        .status_ranges("keys")
        .expect("status")
        .into_iter()
        .map(run)
        .collect();
    assert_eq!(ranges, vec![(RecordStatus::Error, 0, 5)]);
    let row = store.get_record("keys", 2).expect("read").expect("row");
    assert!(row.body.input.is_none());
    assert!(row.body.err_msg.is_some());
}

#[test]
fn panicking_record_only_fails_itself() {
    let (_temp, store) = common::open_store();
    common::insert_job(&store, "panic");
    store
        .reserve_and_insert("panic", common::rows(4))
        .expect("rows");

    let engine = FaultyEngine {
        panic_on: Some("person2"),
        ..FaultyEngine::default()
    };
    let worker = Worker::new(Arc::clone(&store), Arc::new(engine));
    let report = worker.process_chunk(&task("panic", 0, 4)).expect("chunk");
    assert_eq!(report.claimed, 4);
    assert_eq!(report.done, 3);
    assert_eq!(report.errored, 1);

    let ranges: Vec<_> = store
        .status_ranges("panic")
        .expect("status")
        .into_iter()
        .map(run)
        .collect();
    assert_eq!(
        ranges,
        vec![
            (RecordStatus::Done, 0, 2),
            (RecordStatus::Error, 2, 3),
            (RecordStatus::Done, 3, 4),
        ]
    );
    let failed = store.get_record("panic", 2).expect("read").expect("row");
    assert!(
        failed
            .body
            .err_msg
            .as_deref()
            .is_some_and(|msg| msg.contains("poisoned record"))
    );
}

#[test]
fn reprocessing_a_chunk_leaves_terminal_rows_alone() {
    let (_temp, store) = common::open_store();
    common::insert_job(&store, "retry");
    store
        .reserve_and_insert("retry", common::rows(3))
        .expect("rows");

    let worker = Worker::new(Arc::clone(&store), Arc::new(BloomDigestEngine::new()));
    let first = worker.process_chunk(&task("retry", 0, 3)).expect("first");
    assert_eq!(first.done, 3);
    let before = store.get_record("retry", 1).expect("read").expect("row");

    let second = worker.process_chunk(&task("retry", 0, 3)).expect("second");
    assert_eq!(second.claimed, 0);
    let after = store.get_record("retry", 1).expect("read").expect("row");
    assert_eq!(before, after);
}

#[test]
fn chunk_for_deleted_job_is_a_no_op() {
    let (_temp, store) = common::open_store();
    common::insert_job(&store, "vanished");
    store
        .reserve_and_insert("vanished", common::rows(2))
        .expect("rows");
    store.delete_job("vanished").expect("delete");

    let worker = Worker::new(Arc::clone(&store), Arc::new(BloomDigestEngine::new()));
    let report = worker
        .process_chunk(&task("vanished", 0, 2))
        .expect("no-op");
    assert!(report.job_missing);
    assert_eq!(report.claimed, 0);
}

#[test]
fn stale_chunk_never_writes_into_a_recreated_job() {
    let (_temp, store) = common::open_store();
    common::insert_job(&store, "reused");
    store
        .reserve_and_insert("reused", common::rows(2))
        .expect("rows");

    let engine = RecreatingEngine {
        inner: BloomDigestEngine::new(),
        store: Arc::clone(&store),
        job_id: "reused",
        fired: AtomicBool::new(false),
    };
    let worker = Worker::new(Arc::clone(&store), Arc::new(engine));
    let report = worker
        .process_chunk(&task("reused", 0, 2))
        .expect("stale chunk settles quietly");
    assert_eq!(report.claimed, 2);
    assert_eq!(report.done, 2);
    assert_eq!(report.dropped, 2);

    let ranges: Vec<_> = store
        .status_ranges("reused")
        .expect("status")
        .into_iter()
        .map(run)
        .collect();
    assert_eq!(ranges, vec![(RecordStatus::InProgress, 0, 2)]);
    let row = store.get_record("reused", 0).expect("read").expect("row");
    assert!(row.body.digest.is_none());
    assert!(row.body.input.is_some());
}
