//! Destination for normalized rows. Writes are upserts by primary key, so a
//! page emitted twice leaves the destination unchanged.
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

use crate::error::SinkError;
use crate::model::{NormalizedRecord, TableSchema};

#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Upsert one page of rows into `schema.table`. Returns rows written.
    async fn upsert(
        &self,
        schema: &TableSchema,
        records: &[NormalizedRecord],
    ) -> Result<usize, SinkError>;
}

type Table = BTreeMap<String, Value>;

/// In-memory destination keyed by table and primary key.
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: Mutex<HashMap<String, Table>>,
    writes: Mutex<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows of `table` ordered by primary key.
    pub async fn rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .lock()
            .await
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn keys(&self, table: &str) -> Vec<String> {
        self.tables
            .lock()
            .await
            .get(table)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Total upserts applied, duplicates included.
    pub async fn write_count(&self) -> usize {
        *self.writes.lock().await
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn upsert(
        &self,
        schema: &TableSchema,
        records: &[NormalizedRecord],
    ) -> Result<usize, SinkError> {
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            rows.push((record.primary_key().to_string(), record.to_row()?));
        }
        let mut tables = self.tables.lock().await;
        let table = tables.entry(schema.table.to_string()).or_default();
        let written = rows.len();
        for (key, row) in rows {
            match table.get(&key) {
                Some(existing) if schema.same_content(existing, &row) => {}
                _ => {
                    table.insert(key, row);
                }
            }
        }
        *self.writes.lock().await += written;
        Ok(written)
    }
}
