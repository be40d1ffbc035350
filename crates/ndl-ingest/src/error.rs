// Errors surfaced by the ingestion service

use ndl_common::CommonError;

use crate::client::FetchError;
use crate::repository::RepositoryError;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Config(#[from] CommonError),

    /// The run cannot start, e.g. fundamentals requested before any company exists
    #[error("{0}")]
    Precondition(String),

    /// Every unit of a run failed before writing a row
    #[error("{0}")]
    NothingWritten(String),

    #[error("Write task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl IngestError {
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }
}
