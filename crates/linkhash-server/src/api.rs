//! Protocol types shared between the HTTP layer and the coordinator.
//!
//! The server only knows the `LinkageApi` trait; `linkhash-app` provides the
//! implementation backed by the record store and worker pool.

use std::fmt;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use strum::{AsRefStr, EnumIter, EnumString};

pub const PAGE_LIMIT_DEFAULT: usize = 100;
pub const PAGE_LIMIT_MAX: usize = 1_000;

/// Processing state of a single record.
///
/// `Queued → InProgress → {Done | InvalidData | Error}`. Terminal states are
/// never left automatically.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RecordStatus {
    Queued,
    InProgress,
    Done,
    InvalidData,
    Error,
}

impl RecordStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::InvalidData | Self::Error)
    }

    /// Whether a record may move from `self` to `next`.
    ///
    /// Besides the forward path, two edges exist for recovery: a fatal chunk
    /// may fail rows it never claimed (`Queued → Error`), and rows stranded by
    /// a dead worker may be handed back (`InProgress → Queued`).
    pub const fn can_transition_to(self, next: RecordStatus) -> bool {
        use RecordStatus::*;
        matches!(
            (self, next),
            (Queued, InProgress)
                | (Queued, Error)
                | (InProgress, Done)
                | (InProgress, InvalidData)
                | (InProgress, Error)
                | (InProgress, Queued)
        )
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Half-open index range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexRange {
    pub start: u64,
    pub end: u64,
}

impl IndexRange {
    pub const fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub const fn len(&self) -> u64 {
        self.end - self.start
    }

    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub const fn contains(&self, index: u64) -> bool {
        self.start <= index && index < self.end
    }
}

/// Run of contiguous indices sharing one status, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRange {
    pub status: RecordStatus,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub job_id: String,
    pub schema: Value,
    pub secret: Vec<u8>,
}

/// Public view of a job. Secret material is never part of it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub job_id: String,
    pub schema: Value,
}

#[derive(Debug, Clone)]
pub struct SubmitBatchRequest {
    pub job_id: String,
    pub payload: Vec<u8>,
    pub has_header: bool,
    pub validate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchReceipt {
    pub start_index: u64,
    pub end_index: u64,
    pub count: u64,
    pub chunks_dispatched: u64,
    pub chunks_failed: u64,
}

/// Conjunction of independent record predicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub index_start: Option<u64>,
    pub index_end: Option<u64>,
    /// Empty means "any status".
    pub statuses: Vec<RecordStatus>,
}

impl RecordFilter {
    pub fn matches_status(&self, status: RecordStatus) -> bool {
        self.statuses.is_empty() || self.statuses.contains(&status)
    }
}

#[derive(Debug, Clone)]
pub struct ListRecordsParams {
    pub job_id: String,
    pub filter: RecordFilter,
    pub limit: usize,
    pub cursor: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordView {
    pub index: u64,
    pub status: RecordStatus,
    pub err_msg: Option<String>,
    #[serde(serialize_with = "serialize_digest")]
    pub digest: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordPage {
    pub records: Vec<RecordView>,
    pub next_cursor: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RedispatchReceipt {
    pub records_requeued: u64,
    pub chunks_dispatched: u64,
    pub chunks_failed: u64,
}

fn serialize_digest<S>(digest: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match digest {
        Some(bytes) => serializer.serialize_some(&BASE64.encode(bytes)),
        None => serializer.serialize_none(),
    }
}

#[async_trait]
pub trait LinkageApi: Send + Sync + 'static {
    async fn create_job(&self, request: CreateJobRequest) -> Result<(), ApiFailure>;
    async fn list_jobs(&self) -> Result<Vec<String>, ApiFailure>;
    async fn get_job(&self, job_id: String) -> Result<JobView, ApiFailure>;
    async fn delete_job(&self, job_id: String) -> Result<(), ApiFailure>;
    async fn submit_batch(&self, request: SubmitBatchRequest) -> Result<BatchReceipt, ApiFailure>;
    async fn status_ranges(&self, job_id: String) -> Result<Vec<StatusRange>, ApiFailure>;
    async fn list_records(&self, params: ListRecordsParams) -> Result<RecordPage, ApiFailure>;
    async fn delete_records(&self, job_id: String, filter: RecordFilter)
    -> Result<u64, ApiFailure>;
    async fn redispatch(&self, job_id: String, validate: bool)
    -> Result<RedispatchReceipt, ApiFailure>;
}

#[derive(Debug, Clone)]
pub struct ApiFailure {
    pub kind: FailureKind,
    pub message: String,
    pub field: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    InvalidParameter,
    NotFound { resource: String },
    Conflict,
    InvalidSchema,
    InvalidData,
    CursorOutOfBounds,
    Internal,
}

impl ApiFailure {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        ApiFailure {
            kind,
            message: message.into(),
            field: None,
        }
    }

    pub fn invalid_param(field: impl Into<String>, message: impl Into<String>) -> Self {
        ApiFailure {
            field: Some(field.into()),
            ..Self::new(FailureKind::InvalidParameter, message)
        }
    }

    pub fn not_found(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            FailureKind::NotFound {
                resource: resource.into(),
            },
            message,
        )
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Conflict, message)
    }

    pub fn invalid_schema(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidSchema, message)
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidData, message)
    }

    pub fn cursor_out_of_bounds(message: impl Into<String>) -> Self {
        ApiFailure {
            field: Some("cursor".to_string()),
            ..Self::new(FailureKind::CursorOutOfBounds, message)
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, message)
    }
}

impl fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiFailure {}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in RecordStatus::iter().filter(|s| s.is_terminal()) {
            for to in RecordStatus::iter() {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn forward_path_is_allowed() {
        assert!(RecordStatus::Queued.can_transition_to(RecordStatus::InProgress));
        assert!(RecordStatus::InProgress.can_transition_to(RecordStatus::Done));
        assert!(RecordStatus::InProgress.can_transition_to(RecordStatus::InvalidData));
        assert!(RecordStatus::InProgress.can_transition_to(RecordStatus::Error));
        assert!(!RecordStatus::Queued.can_transition_to(RecordStatus::Done));
    }

    #[test]
    fn status_names_are_snake_case() {
        assert_eq!(RecordStatus::InvalidData.as_ref(), "invalid_data");
        assert_eq!(
            RecordStatus::from_str("in_progress").expect("parse"),
            RecordStatus::InProgress
        );
        let json = serde_json::to_string(&RecordStatus::InProgress).expect("json");
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn digest_is_base64_on_the_wire() {
        let view = RecordView {
            index: 3,
            status: RecordStatus::Done,
            err_msg: None,
            digest: Some(vec![0xde, 0xad, 0xbe, 0xef]),
        };
        let value = serde_json::to_value(&view).expect("json");
        assert_eq!(value["digest"], "3q2+7w==");
        assert_eq!(value["status"], "done");
    }

    #[test]
    fn empty_status_filter_matches_everything() {
        let filter = RecordFilter::default();
        assert!(filter.matches_status(RecordStatus::Error));
        let filter = RecordFilter {
            statuses: vec![RecordStatus::Done],
            ..RecordFilter::default()
        };
        assert!(filter.matches_status(RecordStatus::Done));
        assert!(!filter.matches_status(RecordStatus::Queued));
    }
}
