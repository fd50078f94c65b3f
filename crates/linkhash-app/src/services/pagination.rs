//! Cursor pagination over a job's records.
//!
//! The cursor is the index of the last record returned. A follow-up call
//! resumes at `cursor + 1`, so deletions between pages only make indices
//! disappear; they never shift or repeat records.

use linkhash_server::{PAGE_LIMIT_MAX, RecordFilter, RecordPage};
use thiserror::Error;

use crate::services::jobs::{JobStore, JobStoreError};

#[derive(Debug, Error)]
pub enum PageError {
    #[error("limit must be between 1 and {max}, got {limit}")]
    InvalidLimit { limit: usize, max: usize },
    #[error("index_end {end} is smaller than index_start {start}")]
    InvalidBounds { start: u64, end: u64 },
    #[error("cursor {cursor} lies outside the requested index bounds")]
    CursorOutOfBounds { cursor: u64 },
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub filter: RecordFilter,
    pub limit: usize,
    pub cursor: Option<u64>,
}

/// Lowest index to scan once the cursor is applied. `None` means the cursor
/// already sits on the last possible index.
fn scan_window(filter: &RecordFilter, cursor: Option<u64>) -> Result<Option<u64>, PageError> {
    let start = filter.index_start.unwrap_or(0);
    if let Some(end) = filter.index_end {
        if end < start {
            return Err(PageError::InvalidBounds { start, end });
        }
    }
    let Some(cursor) = cursor else {
        return Ok(Some(start));
    };
    let beyond_end = filter.index_end.is_some_and(|end| cursor >= end);
    if cursor < start || beyond_end {
        return Err(PageError::CursorOutOfBounds { cursor });
    }
    Ok(cursor.checked_add(1))
}

impl JobStore {
    pub fn list_page(&self, job_id: &str, request: &PageRequest) -> Result<RecordPage, PageError> {
        if request.limit == 0 || request.limit > PAGE_LIMIT_MAX {
            return Err(PageError::InvalidLimit {
                limit: request.limit,
                max: PAGE_LIMIT_MAX,
            });
        }
        let Some(lower) = scan_window(&request.filter, request.cursor)? else {
            // Still confirm the job exists before answering with an empty page.
            self.scan_records(job_id, 0, Some(0), &request.filter, 0)?;
            return Ok(RecordPage {
                records: Vec::new(),
                next_cursor: None,
            });
        };

        let mut records = self.scan_records(
            job_id,
            lower,
            request.filter.index_end,
            &request.filter,
            request.limit + 1,
        )?;
        let next_cursor = if records.len() > request.limit {
            records.truncate(request.limit);
            records.last().map(|record| record.index)
        } else {
            None
        };
        Ok(RecordPage {
            records,
            next_cursor,
        })
    }
}
