//! One sync invocation for one record kind.
//!
//! The orchestrator walks `Idle → Fetching → Mapping → Emitting →
//! Checkpointing` page by page until the upstream runs dry, the page budget
//! is spent, or something fails. A page only counts once its checkpoint is
//! durable; a failure anywhere before that leaves the stored state where the
//! previous page put it, so the next invocation re-fetches the same page and
//! the sink's upsert absorbs the repeat.

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{ConnectorConfig, DEFAULT_PAGE_BUDGET, DEFAULT_PAGE_SIZE};
use crate::cursor::Cursor;
use crate::error::SyncError;
use crate::mapper::{self, MappedPage};
use crate::model::{RawPage, RecordKind, SyncState};
use crate::openfda::PageFetcher;
use crate::sink::RecordSink;
use crate::store::StateStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    pub page_size: u32,
    /// Stop after this many checkpointed pages. `None` runs until exhausted.
    pub max_pages: Option<u32>,
    /// Only consulted when no state is stored yet.
    pub start_date: Option<NaiveDate>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: Some(DEFAULT_PAGE_BUDGET),
            start_date: None,
        }
    }
}

impl SyncOptions {
    pub fn from_config(sync: &ConnectorConfig, page_budget: u32) -> Self {
        Self {
            page_size: sync.page_size,
            max_pages: Some(page_budget),
            start_date: sync.start_date,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Upstream reported no further pages.
    Exhausted,
    PageBudget,
}

/// Outcome of an invocation that reached DONE.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub record_kind: RecordKind,
    pub pages: u32,
    pub emitted: usize,
    pub skipped: usize,
    /// Last checkpointed state, or the loaded one if nothing was checkpointed.
    pub state: SyncState,
    pub stop: StopReason,
}

/// Outcome of an invocation that reached FAILED. Counts cover only the pages
/// checkpointed before the failure.
#[derive(Debug, Error)]
#[error("sync of {record_kind} failed after {pages} checkpointed page(s)")]
pub struct SyncFailure {
    #[source]
    pub error: SyncError,
    pub run_id: Uuid,
    pub record_kind: RecordKind,
    pub pages: u32,
    pub emitted: usize,
    pub skipped: usize,
    /// `None` when the state could not be loaded.
    pub state: Option<SyncState>,
}

impl SyncFailure {
    pub fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }
}

enum Phase {
    Idle,
    Fetching(SyncState),
    Mapping(SyncState, RawPage),
    Emitting(SyncState, RawPage, MappedPage),
    Checkpointing(SyncState, RawPage, MappedPage),
    Done(SyncState, StopReason),
}

struct Progress {
    run_id: Uuid,
    record_kind: RecordKind,
    pages: u32,
    emitted: usize,
    skipped: usize,
    state: Option<SyncState>,
}

impl Progress {
    fn fail(self, error: SyncError) -> SyncFailure {
        warn!(
            error = %error,
            retryable = error.is_retryable(),
            pages = self.pages,
            emitted = self.emitted,
            "sync failed"
        );
        SyncFailure {
            error,
            run_id: self.run_id,
            record_kind: self.record_kind,
            pages: self.pages,
            emitted: self.emitted,
            skipped: self.skipped,
            state: self.state,
        }
    }

    fn finish(self, state: SyncState, stop: StopReason) -> SyncReport {
        info!(
            pages = self.pages,
            emitted = self.emitted,
            skipped = self.skipped,
            cursor = %state.cursor,
            ?stop,
            "sync done"
        );
        SyncReport {
            run_id: self.run_id,
            record_kind: self.record_kind,
            pages: self.pages,
            emitted: self.emitted,
            skipped: self.skipped,
            state,
            stop,
        }
    }
}

/// Cursor past `records`. It must be strictly greater than `current`.
fn next_cursor(
    current: &Cursor,
    kind: RecordKind,
    records: &[Value],
) -> Result<Cursor, SyncError> {
    let next = current.advance(kind, records);
    if next <= *current {
        return Err(SyncError::CursorRegression {
            from: current.clone(),
            to: next,
        });
    }
    Ok(next)
}

/// Collaborators for one invocation. Nothing here outlives `run`.
pub struct Syncer<'a> {
    fetcher: &'a dyn PageFetcher,
    store: &'a dyn StateStore,
    sink: &'a dyn RecordSink,
}

impl<'a> Syncer<'a> {
    pub fn new(
        fetcher: &'a dyn PageFetcher,
        store: &'a dyn StateStore,
        sink: &'a dyn RecordSink,
    ) -> Self {
        Self {
            fetcher,
            store,
            sink,
        }
    }

    pub async fn run(
        &self,
        kind: RecordKind,
        opts: &SyncOptions,
    ) -> Result<SyncReport, SyncFailure> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync", %run_id, record_kind = %kind);
        self.drive(run_id, kind, opts).instrument(span).await
    }

    async fn drive(
        &self,
        run_id: Uuid,
        kind: RecordKind,
        opts: &SyncOptions,
    ) -> Result<SyncReport, SyncFailure> {
        let schema = kind.schema();
        let mut progress = Progress {
            run_id,
            record_kind: kind,
            pages: 0,
            emitted: 0,
            skipped: 0,
            state: None,
        };
        let mut phase = Phase::Idle;

        loop {
            phase = match phase {
                Phase::Idle => {
                    let default = SyncState::initial(kind, opts.start_date);
                    match self.store.load_or(default).await {
                        Ok(state) => {
                            info!(cursor = %state.cursor, "sync state loaded");
                            progress.state = Some(state.clone());
                            Phase::Fetching(state)
                        }
                        Err(e) => return Err(progress.fail(SyncError::Load(e))),
                    }
                }

                Phase::Fetching(state) => {
                    match self
                        .fetcher
                        .fetch_page(kind, &state.cursor, opts.page_size)
                        .await
                    {
                        Ok(page) if page.records.is_empty() => {
                            info!(cursor = %state.cursor, "no new records");
                            Phase::Done(state, StopReason::Exhausted)
                        }
                        Ok(page) => Phase::Mapping(state, page),
                        Err(e) => return Err(progress.fail(e.into())),
                    }
                }

                Phase::Mapping(state, page) => {
                    let mapped = mapper::map_page(kind, &page);
                    if mapped.skipped > 0 {
                        warn!(
                            skipped = mapped.skipped,
                            total = page.records.len(),
                            "dropped records without a primary key"
                        );
                    }
                    Phase::Emitting(state, page, mapped)
                }

                Phase::Emitting(state, page, mapped) => {
                    if !mapped.records.is_empty() {
                        if let Err(e) = self.sink.upsert(&schema, &mapped.records).await {
                            return Err(progress.fail(e.into()));
                        }
                    }
                    Phase::Checkpointing(state, page, mapped)
                }

                Phase::Checkpointing(state, page, mapped) => {
                    let cursor = match next_cursor(&state.cursor, kind, &page.records) {
                        Ok(cursor) => cursor,
                        Err(e) => return Err(progress.fail(e)),
                    };
                    let next = SyncState {
                        record_kind: kind,
                        cursor,
                        last_success_time: Some(Utc::now()),
                    };
                    if let Err(e) = self.store.save(&next).await {
                        return Err(progress.fail(SyncError::Checkpoint(e)));
                    }

                    progress.pages += 1;
                    progress.emitted += mapped.records.len();
                    progress.skipped += mapped.skipped;
                    progress.state = Some(next.clone());
                    info!(
                        page = progress.pages,
                        emitted = mapped.records.len(),
                        skipped = mapped.skipped,
                        cursor = %next.cursor,
                        "page checkpointed"
                    );

                    if !page.has_more {
                        Phase::Done(next, StopReason::Exhausted)
                    } else if opts.max_pages.is_some_and(|max| progress.pages >= max) {
                        Phase::Done(next, StopReason::PageBudget)
                    } else {
                        Phase::Fetching(next)
                    }
                }

                Phase::Done(state, stop) => return Ok(progress.finish(state, stop)),
            };
        }
    }
}
