use axum::http::StatusCode;
use std::fmt::Display;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The log could not be written or read. The record was not committed and
    /// the whole batch may be retried.
    #[error("store unavailable: {0}")]
    Unavailable(#[from] std::io::Error),
    #[error("corrupt segment {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
    /// Nothing was written; the record can never be stored as is.
    #[error("record `{uuid}` encodes to {len} bytes, over the {max} byte frame limit")]
    RecordTooLarge { uuid: String, len: u64, max: u64 },
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub fn map_store_error(err: StoreError) -> (StatusCode, String) {
    let status = match &err {
        StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        StoreError::RecordTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        StoreError::Corrupt { .. } | StoreError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::error!(error = %err, status = %status, "store error");
    (status, err.to_string())
}

pub fn internal_error(err: impl Display) -> (StatusCode, String) {
    tracing::error!(error = %err, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal server error".to_string(),
    )
}
