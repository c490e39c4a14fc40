//! Error taxonomy for one sync invocation.
use thiserror::Error;

use crate::cursor::Cursor;

/// Failure to obtain a page from openFDA.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network failure, 429 or 5xx that outlasted the retry budget. The
    /// invocation may be retried later from the same cursor.
    #[error("openFDA unavailable after {attempts} attempts: {last_error}")]
    Transient { attempts: u32, last_error: String },
    /// A 4xx other than 429: the request itself is wrong.
    #[error("openFDA rejected the request with HTTP {status}: {body}")]
    Permanent { status: u16, body: String },
    #[error("invalid fetch request: {0}")]
    InvalidRequest(String),
    /// More records share one date than openFDA lets a query skip over. The
    /// cursor cannot move past this date without a narrower query.
    #[error("cursor {cursor} is beyond openFDA's skip limit of {limit}")]
    SkipLimit { cursor: Cursor, limit: u64 },
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Stored state that cannot be trusted. Needs an operator (`reset`).
    #[error("stored sync state for {kind} is corrupt: {detail}")]
    Corrupt { kind: String, detail: String },
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to encode row: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("row rejected by sink: {0}")]
    Rejected(String),
}

/// Why an invocation ended in FAILED.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to load sync state: {0}")]
    Load(#[source] StoreError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("failed to emit rows: {0}")]
    Sink(#[from] SinkError),
    #[error("failed to checkpoint sync state: {0}")]
    Checkpoint(#[source] StoreError),
    /// Checked before every checkpoint. Advancing past a non-empty page
    /// always moves the cursor forward, so this only fires if that rule is
    /// broken.
    #[error("cursor would not move forward from {from} to {to}")]
    CursorRegression { from: Cursor, to: Cursor },
}

impl SyncError {
    /// Whether re-running the whole invocation later can succeed unattended.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Load(e) => e.is_retryable(),
            SyncError::Fetch(e) => e.is_retryable(),
            SyncError::Sink(_) => true,
            SyncError::Checkpoint(_) => true,
            SyncError::CursorRegression { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_taxonomy() {
        let transient = SyncError::Fetch(FetchError::Transient {
            attempts: 5,
            last_error: "503".into(),
        });
        assert!(transient.is_retryable());

        let permanent = SyncError::Fetch(FetchError::Permanent {
            status: 400,
            body: "bad search".into(),
        });
        assert!(!permanent.is_retryable());

        let corrupt = SyncError::Load(StoreError::Corrupt {
            kind: "label".into(),
            detail: "bad cursor".into(),
        });
        assert!(!corrupt.is_retryable());

        assert!(SyncError::Sink(SinkError::Rejected("x".into())).is_retryable());
        assert!(SyncError::Checkpoint(StoreError::Database(sqlx::Error::PoolClosed)).is_retryable());
    }
}
