use strand_core::CoreError;
use thiserror::Error;

/// Errors raised while deriving transactions from a committed one.
#[derive(Debug, Error)]
pub enum ActivityError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Failure of a single notification channel. Never aborts the batch.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Mail service rejected message: {status}")]
    Rejected { status: u16 },

    #[error("No template for notification type {0}")]
    MissingTemplate(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

pub type ActivityResult<T> = Result<T, ActivityError>;
