//! Error types for actisleep

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::StableId;

/// Errors that can occur while scoring, editing, or exporting sleep periods
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Incomplete epoch data: {0}")]
    IncompleteData(String),

    #[error("Boundary {timestamp} is outside available data ({first} to {last})")]
    OutOfRangeBoundary {
        timestamp: DateTime<Utc>,
        first: DateTime<Utc>,
        last: DateTime<Utc>,
    },

    #[error(
        "Epoch duration changed from {persisted}s to {current}s since last write; re-import required"
    )]
    EpochDurationMismatch { persisted: u32, current: u32 },

    #[error("Unknown period: {0}")]
    UnknownPeriod(StableId),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}
