//! Application-level error type shared across binaries and services.

use thiserror::Error;

use crate::config;
use crate::paths::PathError;
use crate::services::{JobStoreError, PageError, ServiceError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] config::AppConfigError),
    #[error(transparent)]
    Server(#[from] linkhash_server::ServerError),
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error(transparent)]
    Jobs(#[from] Box<JobStoreError>),
    #[error(transparent)]
    Page(#[from] PageError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("failed to write output: {0}")]
    Output(#[source] std::io::Error),
    #[error("job `{0}` not found")]
    JobNotFound(String),
}

impl From<JobStoreError> for AppError {
    fn from(e: JobStoreError) -> Self {
        AppError::Jobs(Box::new(e))
    }
}
