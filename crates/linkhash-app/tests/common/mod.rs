#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use linkhash_app::config::WorkerConfig;
use linkhash_app::paths::AppPaths;
use linkhash_app::services::{Job, JobStore};
use linkhash_server::{RecordStatus, StatusRange};
use serde_json::{Value, json};
use tempfile::TempDir;

pub const SECRET: &[u8] = b"correct horse battery staple";

pub fn schema_json() -> Value {
    json!({
        "version": 1,
        "clkConfig": { "l": 128, "k": 10, "kdf": { "type": "BLAKE3" } },
        "features": [
            { "identifier": "name",
              "format": { "type": "string", "minLength": 1, "maxLength": 40 },
              "hashing": { "ngram": 2 } },
            { "identifier": "age",
              "format": { "type": "integer", "minimum": 0, "maximum": 150 },
              "hashing": { "ngram": 1, "positional": true } }
        ]
    })
}

pub fn open_store() -> (TempDir, Arc<JobStore>) {
    let temp = TempDir::new().expect("temp dir");
    let paths = AppPaths::new(temp.path()).expect("paths");
    let store = JobStore::open(&paths).expect("open store");
    (temp, Arc::new(store))
}

pub fn insert_job(store: &JobStore, job_id: &str) {
    let job = Job::new(job_id, schema_json().to_string(), SECRET.to_vec());
    store.create_job(&job).expect("create job");
}

pub fn rows(n: usize) -> Vec<Vec<String>> {
    (0..n)
        .map(|i| vec![format!("person{i}"), (i % 100).to_string()])
        .collect()
}

pub fn worker_config(chunk_size: u64, concurrency: usize) -> WorkerConfig {
    WorkerConfig {
        concurrency,
        chunk_size,
        queue_capacity: 64,
        enqueue_timeout_ms: 1_000,
    }
}

/// Poll until no record of `job_id` is queued or in progress.
pub async fn wait_until_settled(store: &JobStore, job_id: &str) -> Vec<StatusRange> {
    for _ in 0..400 {
        let ranges = store.status_ranges(job_id).expect("status ranges");
        let pending = ranges
            .iter()
            .any(|r| matches!(r.status, RecordStatus::Queued | RecordStatus::InProgress));
        if !pending {
            return ranges;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job `{job_id}` did not settle in time");
}
