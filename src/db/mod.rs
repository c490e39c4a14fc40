//! SQLite persistence: sync state, destination tables and the run log.
//!
//! - `model`: row types returned by the repository.
//! - `repo`: SQL-only functions over a [`Pool`].
//!
//! [`SqliteStateStore`] and [`SqliteSink`] put the repository behind the
//! [`StateStore`] and [`RecordSink`] seams used by the orchestrator.

pub mod model;
pub mod repo;

pub use model::{RunRecord, StoredState};
pub use repo::*;

use async_trait::async_trait;

use crate::error::{SinkError, StoreError};
use crate::model::{NormalizedRecord, RecordKind, SyncState, TableSchema};
use crate::sink::RecordSink;
use crate::store::StateStore;

#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    pool: Pool,
}

impl SqliteStateStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load(&self, kind: RecordKind) -> Result<Option<SyncState>, StoreError> {
        load_state(&self.pool, kind).await
    }

    async fn save(&self, state: &SyncState) -> Result<(), StoreError> {
        save_state(&self.pool, state).await
    }

    async fn reset(&self, kind: RecordKind) -> Result<bool, StoreError> {
        delete_state(&self.pool, kind).await
    }
}

#[derive(Debug, Clone)]
pub struct SqliteSink {
    pool: Pool,
}

impl SqliteSink {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordSink for SqliteSink {
    async fn upsert(
        &self,
        schema: &TableSchema,
        records: &[NormalizedRecord],
    ) -> Result<usize, SinkError> {
        upsert_rows(&self.pool, schema, records).await
    }
}
