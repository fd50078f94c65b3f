//! The record-processing coordinator: the synchronous operations behind every
//! client-visible action, plus the async `LinkageApi` facade the HTTP layer
//! drives.

use std::sync::Arc;

use async_trait::async_trait;
use linkhash_server::{
    ApiFailure, BatchReceipt, CreateJobRequest, IndexRange, JobView, LinkageApi,
    ListRecordsParams, RecordFilter, RecordPage, RecordStatus, RedispatchReceipt, StatusRange,
    SubmitBatchRequest,
};
use thiserror::Error;
use tokio::task;

use crate::digest::{DigestEngine, DigestError, LinkageSchema};
use crate::services::dispatcher::{DispatchReport, Dispatcher};
use crate::services::ingest::{IngestError, parse_csv_batch};
use crate::services::jobs::{Job, JobStore, JobStoreError, validate_job_id};
use crate::services::pagination::{PageError, PageRequest};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Digest(#[from] DigestError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Page(#[from] PageError),
    #[error("secret must not be empty")]
    EmptySecret,
    #[error("stored schema for job `{0}` is unreadable")]
    CorruptSchema(String),
    #[error("blocking task failed: {0}")]
    Join(String),
}

impl From<ServiceError> for ApiFailure {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::Store(store) => store_failure(store),
            ServiceError::Digest(DigestError::InvalidSchema(message)) => {
                ApiFailure::invalid_schema(message)
            }
            ServiceError::Digest(DigestError::KeyDerivation(message)) => {
                ApiFailure::invalid_schema(format!("key derivation rejected schema: {message}"))
            }
            ServiceError::Digest(other) => ApiFailure::internal(other.to_string()),
            ServiceError::Ingest(ingest) => ApiFailure::invalid_data(ingest.to_string()),
            ServiceError::Page(PageError::Store(store)) => store_failure(store),
            ServiceError::Page(page @ PageError::InvalidLimit { .. }) => {
                ApiFailure::invalid_param("limit", page.to_string())
            }
            ServiceError::Page(page @ PageError::InvalidBounds { .. }) => {
                ApiFailure::invalid_param("index_end", page.to_string())
            }
            ServiceError::Page(page @ PageError::CursorOutOfBounds { .. }) => {
                ApiFailure::cursor_out_of_bounds(page.to_string())
            }
            ServiceError::EmptySecret => ApiFailure::invalid_param("secret", "must not be empty"),
            other => ApiFailure::internal(other.to_string()),
        }
    }
}

fn store_failure(error: JobStoreError) -> ApiFailure {
    match error {
        JobStoreError::NotFound(job_id) => {
            ApiFailure::not_found("job_id", format!("job `{job_id}` not found"))
        }
        JobStoreError::Duplicate(job_id) => {
            ApiFailure::conflict(format!("job `{job_id}` already exists"))
        }
        JobStoreError::InvalidJobId(reason) => ApiFailure::invalid_param("job_id", reason),
        overflow @ JobStoreError::CounterOverflow { .. } => {
            ApiFailure::conflict(overflow.to_string())
        }
        other => ApiFailure::internal(other.to_string()),
    }
}

/// Shared handles for the coordinator operations. Cheap to clone.
#[derive(Clone, bon::Builder)]
pub struct LinkageService {
    store: Arc<JobStore>,
    engine: Arc<dyn DigestEngine>,
    dispatcher: Dispatcher,
}

impl LinkageService {
    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn create_job(&self, request: CreateJobRequest) -> Result<(), ServiceError> {
        validate_job_id(&request.job_id)?;
        if request.secret.is_empty() {
            return Err(ServiceError::EmptySecret);
        }
        let schema = LinkageSchema::from_value(&request.schema)?;
        self.engine.check_schema(&schema)?;
        // Surfaces bad KDF parameters now instead of on the first chunk.
        self.engine
            .derive_keys(&request.secret, schema.field_count(), &schema.clk_config.kdf)?;

        let job = Job::new(request.job_id, request.schema.to_string(), request.secret);
        self.store.create_job(&job)?;
        Ok(())
    }

    pub fn list_jobs(&self) -> Result<Vec<String>, ServiceError> {
        Ok(self.store.list_job_ids()?)
    }

    pub fn get_job(&self, job_id: &str) -> Result<JobView, ServiceError> {
        let job = self
            .store
            .get_job(job_id)?
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))?;
        let schema = serde_json::from_str(&job.schema_json)
            .map_err(|_| ServiceError::CorruptSchema(job.job_id.clone()))?;
        Ok(JobView {
            job_id: job.job_id,
            schema,
        })
    }

    pub fn delete_job(&self, job_id: &str) -> Result<u64, ServiceError> {
        Ok(self.store.delete_job(job_id)?)
    }

    /// Parse, store and dispatch one batch.
    ///
    /// The payload is parsed completely before any index is reserved, so a
    /// malformed batch leaves the job untouched.
    pub fn submit_batch(&self, request: SubmitBatchRequest) -> Result<BatchReceipt, ServiceError> {
        let rows = parse_csv_batch(&request.payload, request.has_header)?;
        let range = self.store.reserve_and_insert(&request.job_id, rows)?;
        let report = self
            .dispatcher
            .dispatch(&request.job_id, request.validate, range);
        tracing::info!(
            job_id = %request.job_id,
            start = range.start,
            end = range.end,
            chunks = report.chunks_dispatched,
            chunks_failed = report.chunks_failed,
            "batch accepted"
        );
        Ok(BatchReceipt {
            start_index: range.start,
            end_index: range.end,
            count: range.len(),
            chunks_dispatched: report.chunks_dispatched,
            chunks_failed: report.chunks_failed,
        })
    }

    pub fn status_ranges(&self, job_id: &str) -> Result<Vec<StatusRange>, ServiceError> {
        Ok(self.store.status_ranges(job_id)?)
    }

    pub fn list_records(&self, params: ListRecordsParams) -> Result<RecordPage, ServiceError> {
        let request = PageRequest {
            filter: params.filter,
            limit: params.limit,
            cursor: params.cursor,
        };
        Ok(self.store.list_page(&params.job_id, &request)?)
    }

    pub fn delete_records(&self, job_id: &str, filter: &RecordFilter) -> Result<u64, ServiceError> {
        Ok(self.store.delete_records(job_id, filter)?)
    }

    /// Re-enqueue every run of `Queued` rows, e.g. after a dispatch failure.
    pub fn redispatch_queued(
        &self,
        job_id: &str,
        validate: bool,
    ) -> Result<RedispatchReceipt, ServiceError> {
        let queued: Vec<IndexRange> = self
            .store
            .status_ranges(job_id)?
            .into_iter()
            .filter(|run| run.status == RecordStatus::Queued)
            .map(|run| IndexRange::new(run.start, run.end))
            .collect();

        let mut report = DispatchReport::default();
        let mut records = 0_u64;
        for range in queued {
            let sent = self.dispatcher.dispatch(job_id, validate, range);
            let stopped = sent.chunks_failed > 0;
            report.merge(sent);
            records = records.saturating_add(range.len());
            if stopped {
                break;
            }
        }
        tracing::info!(
            job_id,
            records,
            chunks = report.chunks_dispatched,
            chunks_failed = report.chunks_failed,
            "queued records re-dispatched"
        );
        Ok(RedispatchReceipt {
            records_requeued: records,
            chunks_dispatched: report.chunks_dispatched,
            chunks_failed: report.chunks_failed,
        })
    }

    /// Return rows stranded `InProgress` to `Queued`. Only safe while no
    /// worker is processing the job.
    pub fn requeue_in_progress(&self, job_id: &str) -> Result<u64, ServiceError> {
        let requeued = self.store.requeue_in_progress(job_id)?;
        tracing::info!(job_id, requeued, "in-progress records returned to queue");
        Ok(requeued)
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, ApiFailure>
    where
        T: Send + 'static,
        F: FnOnce(LinkageService) -> Result<T, ServiceError> + Send + 'static,
    {
        let service = self.clone();
        task::spawn_blocking(move || op(service))
            .await
            .map_err(|err| ApiFailure::from(ServiceError::Join(err.to_string())))?
            .map_err(ApiFailure::from)
    }
}

#[async_trait]
impl LinkageApi for LinkageService {
    async fn create_job(&self, request: CreateJobRequest) -> Result<(), ApiFailure> {
        self.blocking(move |svc| svc.create_job(request)).await
    }

    async fn list_jobs(&self) -> Result<Vec<String>, ApiFailure> {
        self.blocking(|svc| svc.list_jobs()).await
    }

    async fn get_job(&self, job_id: String) -> Result<JobView, ApiFailure> {
        self.blocking(move |svc| svc.get_job(&job_id)).await
    }

    async fn delete_job(&self, job_id: String) -> Result<(), ApiFailure> {
        self.blocking(move |svc| svc.delete_job(&job_id).map(|_| ()))
            .await
    }

    async fn submit_batch(&self, request: SubmitBatchRequest) -> Result<BatchReceipt, ApiFailure> {
        self.blocking(move |svc| svc.submit_batch(request)).await
    }

    async fn status_ranges(&self, job_id: String) -> Result<Vec<StatusRange>, ApiFailure> {
        self.blocking(move |svc| svc.status_ranges(&job_id)).await
    }

    async fn list_records(&self, params: ListRecordsParams) -> Result<RecordPage, ApiFailure> {
        self.blocking(move |svc| svc.list_records(params)).await
    }

    async fn delete_records(
        &self,
        job_id: String,
        filter: RecordFilter,
    ) -> Result<u64, ApiFailure> {
        self.blocking(move |svc| svc.delete_records(&job_id, &filter))
            .await
    }

    async fn redispatch(
        &self,
        job_id: String,
        validate: bool,
    ) -> Result<RedispatchReceipt, ApiFailure> {
        self.blocking(move |svc| svc.redispatch_queued(&job_id, validate))
            .await
    }
}

impl std::fmt::Debug for LinkageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkageService")
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}
