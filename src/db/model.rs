//! Row types returned by the repository functions.

use crate::sync::{SyncFailure, SyncReport};
use serde::Serialize;

/// A `sync_state` row as stored, before cursor validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredState {
    pub record_kind: String,
    pub cursor: String,
    pub last_success_time: Option<String>,
    pub updated_at: Option<String>,
}

/// One finished invocation, successful or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRecord {
    pub id: String,
    pub record_kind: String,
    pub status: String,
    pub pages: i64,
    pub emitted: i64,
    pub skipped: i64,
    pub cursor: Option<String>,
    pub error: Option<String>,
    pub finished_at: Option<String>,
}

impl RunRecord {
    pub fn from_outcome(outcome: &Result<SyncReport, SyncFailure>) -> Self {
        match outcome {
            Ok(report) => Self {
                id: report.run_id.to_string(),
                record_kind: report.record_kind.to_string(),
                status: "done".into(),
                pages: i64::from(report.pages),
                emitted: report.emitted as i64,
                skipped: report.skipped as i64,
                cursor: Some(report.state.cursor.to_string()),
                error: None,
                finished_at: None,
            },
            Err(failure) => Self {
                id: failure.run_id.to_string(),
                record_kind: failure.record_kind.to_string(),
                status: if failure.is_retryable() {
                    "failed_retryable".into()
                } else {
                    "failed_permanent".into()
                },
                pages: i64::from(failure.pages),
                emitted: failure.emitted as i64,
                skipped: failure.skipped as i64,
                cursor: failure.state.as_ref().map(|s| s.cursor.to_string()),
                error: Some(failure.error.to_string()),
                finished_at: None,
            },
        }
    }
}
