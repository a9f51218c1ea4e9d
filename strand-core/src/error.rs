use thiserror::Error;

use crate::ids::DocId;

/// Errors raised by the document model, the in-memory store and the log.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Document not found: {0}")]
    DocumentNotFound(DocId),

    #[error("Document already exists: {0}")]
    DuplicateDocument(DocId),

    #[error("Invalid transaction: {0}")]
    InvalidTx(String),

    #[error("Invalid markup: {0}")]
    Markup(String),

    #[error("Collaborative content error: {0}")]
    Collaborative(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transaction log is closed")]
    Closed,
}

impl From<yrs::encoding::read::Error> for CoreError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        CoreError::Collaborative(e.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
