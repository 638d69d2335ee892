use crate::telemetry::DecodeError;
use axum::http::StatusCode;
use std::fmt::Display;

/// Failures the pipeline recovers from locally. None of them stop the receive loop.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("transport connect failed: {0}")]
    TransportConnect(String),
    #[error("transport disconnected: {reason}")]
    TransportDisconnect { reason: String },
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("store write failed: {0}")]
    StoreWrite(String),
    #[error("snapshot write failed: {0}")]
    SnapshotWrite(String),
}

pub fn internal_error(err: impl Display) -> (StatusCode, String) {
    tracing::error!(error = %err, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal server error".to_string(),
    )
}
