use super::model::{RunRecord, StoredState};
use crate::cursor::Cursor;
use crate::error::{SinkError, StoreError};
use crate::model::{ColumnType, NormalizedRecord, RecordKind, SyncState, TableSchema};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL plus FULL sync: a committed checkpoint survives a crash.
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePool::connect_with(options).await?;
    Ok(pool)
}

/// Expand a leading `~/` in file-backed SQLite URLs and create the parent
/// directory. In-memory and non-SQLite URLs pass through unchanged.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{}?{}", path, q),
        None => format!("sqlite://{}", path),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all, fields(record_kind = %kind))]
pub async fn load_state(pool: &Pool, kind: RecordKind) -> Result<Option<SyncState>, StoreError> {
    let row = sqlx::query("SELECT cursor, last_success_time FROM sync_state WHERE record_kind = ?")
        .bind(kind.as_str())
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let corrupt = |detail: String| StoreError::Corrupt {
        kind: kind.to_string(),
        detail,
    };
    let cursor: String = row.try_get("cursor")?;
    let cursor = cursor
        .parse::<Cursor>()
        .map_err(|e| corrupt(e.to_string()))?;
    let last_success_time = row
        .try_get::<Option<String>, _>("last_success_time")?
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| corrupt(format!("last_success_time '{}': {}", raw, e)))
        })
        .transpose()?;

    Ok(Some(SyncState {
        record_kind: kind,
        cursor,
        last_success_time,
    }))
}

#[instrument(skip_all, fields(record_kind = %state.record_kind, cursor = %state.cursor))]
pub async fn save_state(pool: &Pool, state: &SyncState) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO sync_state (record_kind, cursor, last_success_time, updated_at) \
         VALUES (?, ?, ?, CURRENT_TIMESTAMP) \
         ON CONFLICT(record_kind) DO UPDATE SET \
           cursor = excluded.cursor, \
           last_success_time = excluded.last_success_time, \
           updated_at = CURRENT_TIMESTAMP",
    )
    .bind(state.record_kind.as_str())
    .bind(state.cursor.to_string())
    .bind(state.last_success_time.map(|t| t.to_rfc3339()))
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all, fields(record_kind = %kind))]
pub async fn delete_state(pool: &Pool, kind: RecordKind) -> Result<bool, StoreError> {
    let res = sqlx::query("DELETE FROM sync_state WHERE record_kind = ?")
        .bind(kind.as_str())
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Raw rows, so corrupt state can still be inspected.
pub async fn list_states(pool: &Pool) -> Result<Vec<StoredState>, StoreError> {
    let rows = sqlx::query(
        "SELECT record_kind, cursor, last_success_time, updated_at FROM sync_state ORDER BY record_kind",
    )
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|row| -> Result<StoredState, StoreError> {
            Ok(StoredState {
                record_kind: row.try_get("record_kind")?,
                cursor: row.try_get("cursor")?,
                last_success_time: row.try_get("last_success_time")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .collect()
}

fn upsert_sql(schema: &TableSchema) -> String {
    let columns: Vec<&str> = schema.columns.iter().map(|c| c.name).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    let updates: Vec<String> = columns
        .iter()
        .filter(|name| !schema.primary_key.contains(name))
        .map(|name| format!("{0} = excluded.{0}", name))
        .collect();
    // Re-delivered rows that differ only in fetched_at stay untouched.
    let changed: Vec<String> = schema
        .content_columns()
        .map(|name| format!("{0}.{1} IS NOT excluded.{1}", schema.table, name))
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO UPDATE SET {} WHERE {}",
        schema.table,
        columns.join(", "),
        placeholders,
        schema.primary_key.join(", "),
        updates.join(", "),
        changed.join(" OR ")
    )
}

/// Upsert one page in a single transaction: all rows land or none do.
#[instrument(skip_all, fields(table = schema.table, rows = records.len()))]
pub async fn upsert_rows(
    pool: &Pool,
    schema: &TableSchema,
    records: &[NormalizedRecord],
) -> Result<usize, SinkError> {
    let sql = upsert_sql(schema);
    let mut tx = pool.begin().await?;
    for record in records {
        let row = record.to_row()?;
        for key in &schema.primary_key {
            if row.get(*key).and_then(Value::as_str).map_or(true, str::is_empty) {
                return Err(SinkError::Rejected(format!(
                    "row for {} has no value for key column {}",
                    schema.table, key
                )));
            }
        }

        let mut query = sqlx::query(&sql);
        for column in &schema.columns {
            let value = row.get(column.name).unwrap_or(&Value::Null);
            query = match column.ty {
                ColumnType::String | ColumnType::Timestamp => {
                    query.bind(value.as_str().map(str::to_string))
                }
                ColumnType::Float => query.bind(value.as_f64()),
                ColumnType::Boolean => query.bind(value.as_bool()),
                ColumnType::Json => query.bind(value.to_string()),
            };
        }
        query.execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(records.len())
}

#[instrument(skip_all, fields(run_id = %run.id))]
pub async fn record_run(pool: &Pool, run: &RunRecord) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO sync_runs (id, record_kind, status, pages, emitted, skipped, cursor, error) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&run.id)
    .bind(&run.record_kind)
    .bind(&run.status)
    .bind(run.pages)
    .bind(run.emitted)
    .bind(run.skipped)
    .bind(&run.cursor)
    .bind(&run.error)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn recent_runs(pool: &Pool, limit: i64) -> Result<Vec<RunRecord>, StoreError> {
    let rows = sqlx::query(
        "SELECT id, record_kind, status, pages, emitted, skipped, cursor, error, finished_at \
         FROM sync_runs ORDER BY finished_at DESC, rowid DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|row| -> Result<RunRecord, StoreError> {
            Ok(RunRecord {
                id: row.try_get("id")?,
                record_kind: row.try_get("record_kind")?,
                status: row.try_get("status")?,
                pages: row.try_get("pages")?,
                emitted: row.try_get("emitted")?,
                skipped: row.try_get("skipped")?,
                cursor: row.try_get("cursor")?,
                error: row.try_get("error")?,
                finished_at: row.try_get("finished_at")?,
            })
        })
        .collect()
}
