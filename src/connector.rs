//! Host-facing entry points.
//!
//! A scheduling host calls [`schema`] once per configured record kind and
//! then [`Connector::update`] repeatedly, handing back the state it received
//! from the previous call. Each call yields the ordered operations the host
//! applies: upserts for a page followed by that page's checkpoint.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::{self, ConfigError, ConnectorConfig, OpenFda, DEFAULT_PAGE_BUDGET};
use crate::error::{FetchError, SinkError, StoreError};
use crate::model::{NormalizedRecord, RecordKind, SyncState, TableSchema};
use crate::openfda::{OpenFdaClient, PageFetcher};
use crate::sink::RecordSink;
use crate::store::StateStore;
use crate::sync::{StopReason, SyncOptions, Syncer};

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build openFDA client: {0}")]
    Fetch(#[from] FetchError),
    #[error("state handed over by the host is not a sync state: {0}")]
    InvalidState(#[source] serde_json::Error),
    #[error("state belongs to {found}, connector is configured for {expected}")]
    StateMismatch {
        expected: RecordKind,
        found: RecordKind,
    },
}

/// Destination table shape for the configured record kind.
pub fn schema(config: &ConnectorConfig) -> TableSchema {
    config.record_kind.schema()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Upsert { table: String, row: Value },
    Checkpoint { state: SyncState },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateOutcome {
    Done {
        pages: u32,
        emitted: usize,
        skipped: usize,
        stop: StopReason,
    },
    Failed {
        retryable: bool,
        error: String,
        pages: u32,
        emitted: usize,
        skipped: usize,
    },
}

impl UpdateOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, UpdateOutcome::Done { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateOutput {
    pub operations: Vec<Operation>,
    /// State to hand to the next `update` call.
    pub state: SyncState,
    pub outcome: UpdateOutcome,
}

pub struct Connector {
    config: ConnectorConfig,
    fetcher: Box<dyn PageFetcher>,
    page_budget: u32,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("record_kind", &self.config.record_kind)
            .field("page_size", &self.config.page_size)
            .field("page_budget", &self.page_budget)
            .finish_non_exhaustive()
    }
}

impl Connector {
    pub fn new(
        config: ConnectorConfig,
        fetcher: Box<dyn PageFetcher>,
    ) -> Result<Self, ConnectorError> {
        config::validate_connector(&config)?;
        Ok(Self {
            config,
            fetcher,
            page_budget: DEFAULT_PAGE_BUDGET,
        })
    }

    /// Connector backed by the live openFDA client.
    pub fn from_settings(
        config: ConnectorConfig,
        settings: &OpenFda,
    ) -> Result<Self, ConnectorError> {
        let api_key = config.api_key().or_else(|| {
            settings
                .api_key
                .as_deref()
                .map(str::trim)
                .filter(|k| !k.is_empty())
        });
        let client = OpenFdaClient::from_settings(settings, api_key)?;
        Self::new(config, Box::new(client))
    }

    pub fn with_page_budget(mut self, pages: u32) -> Self {
        self.page_budget = pages.max(1);
        self
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Run one invocation from `state`. `null` or `{}` is a cold start.
    pub async fn update(&self, state: &Value) -> Result<UpdateOutput, ConnectorError> {
        let kind = self.config.record_kind;
        let initial = self.parse_state(state)?;

        let log = HostLog {
            initial: Mutex::new(initial),
            operations: Mutex::new(Vec::new()),
        };
        let opts = SyncOptions::from_config(&self.config, self.page_budget);
        let result = Syncer::new(self.fetcher.as_ref(), &log, &log)
            .run(kind, &opts)
            .await;

        let operations = log.operations.into_inner();
        let (state, outcome) = match result {
            Ok(report) => (
                report.state,
                UpdateOutcome::Done {
                    pages: report.pages,
                    emitted: report.emitted,
                    skipped: report.skipped,
                    stop: report.stop,
                },
            ),
            Err(failure) => {
                let outcome = UpdateOutcome::Failed {
                    retryable: failure.is_retryable(),
                    error: failure.error.to_string(),
                    pages: failure.pages,
                    emitted: failure.emitted,
                    skipped: failure.skipped,
                };
                let state = failure
                    .state
                    .unwrap_or_else(|| SyncState::initial(kind, self.config.start_date));
                (state, outcome)
            }
        };
        Ok(UpdateOutput {
            operations,
            state,
            outcome,
        })
    }

    fn parse_state(&self, state: &Value) -> Result<Option<SyncState>, ConnectorError> {
        let empty = match state {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            _ => false,
        };
        if empty {
            return Ok(None);
        }
        let parsed: SyncState =
            serde_json::from_value(state.clone()).map_err(ConnectorError::InvalidState)?;
        if parsed.record_kind != self.config.record_kind {
            return Err(ConnectorError::StateMismatch {
                expected: self.config.record_kind,
                found: parsed.record_kind,
            });
        }
        Ok(Some(parsed))
    }
}

/// Store and sink in one: records what the host must apply, in order.
struct HostLog {
    initial: Mutex<Option<SyncState>>,
    operations: Mutex<Vec<Operation>>,
}

#[async_trait]
impl StateStore for HostLog {
    async fn load(&self, kind: RecordKind) -> Result<Option<SyncState>, StoreError> {
        Ok(self
            .initial
            .lock()
            .await
            .clone()
            .filter(|s| s.record_kind == kind))
    }

    async fn save(&self, state: &SyncState) -> Result<(), StoreError> {
        self.operations.lock().await.push(Operation::Checkpoint {
            state: state.clone(),
        });
        *self.initial.lock().await = Some(state.clone());
        Ok(())
    }

    async fn reset(&self, kind: RecordKind) -> Result<bool, StoreError> {
        let mut initial = self.initial.lock().await;
        let had = initial.as_ref().is_some_and(|s| s.record_kind == kind);
        if had {
            *initial = None;
        }
        Ok(had)
    }
}

#[async_trait]
impl RecordSink for HostLog {
    async fn upsert(
        &self,
        schema: &TableSchema,
        records: &[NormalizedRecord],
    ) -> Result<usize, SinkError> {
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            rows.push(Operation::Upsert {
                table: schema.table.to_string(),
                row: record.to_row()?,
            });
        }
        let written = rows.len();
        self.operations.lock().await.extend(rows);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::Cursor;
    use crate::model::RawPage;
    use chrono::Utc;
    use serde_json::json;

    struct OnePage;

    #[async_trait]
    impl PageFetcher for OnePage {
        async fn fetch_page(
            &self,
            _kind: RecordKind,
            cursor: &Cursor,
            _page_size: u32,
        ) -> Result<RawPage, FetchError> {
            let records = if cursor.skip() == 0 && cursor.date() == Cursor::earliest().date() {
                vec![
                    json!({"recall_number": "F-1", "report_date": "20240102"}),
                    json!({"report_date": "20240102"}),
                ]
            } else {
                vec![]
            };
            Ok(RawPage {
                records,
                has_more: false,
                fetch_params: vec![],
                total: None,
                fetched_at: Utc::now(),
            })
        }
    }

    fn connector() -> Connector {
        Connector::new(ConnectorConfig::new(RecordKind::Recall), Box::new(OnePage)).unwrap()
    }

    #[test]
    fn operations_serialize_with_type_tag() {
        let op = Operation::Upsert {
            table: "t".into(),
            row: json!({"a": 1}),
        };
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({"type": "UPSERT", "table": "t", "row": {"a": 1}})
        );
    }

    #[tokio::test]
    async fn cold_start_emits_upserts_then_checkpoint() {
        let out = connector().update(&json!({})).await.unwrap();
        assert_eq!(out.operations.len(), 2);
        assert!(matches!(out.operations[0], Operation::Upsert { .. }));
        assert!(matches!(out.operations[1], Operation::Checkpoint { .. }));
        assert_eq!(out.state.cursor.to_string(), "20240102:2");
        assert_eq!(
            out.outcome,
            UpdateOutcome::Done {
                pages: 1,
                emitted: 1,
                skipped: 1,
                stop: StopReason::Exhausted
            }
        );

        let state = serde_json::to_value(&out.state).unwrap();
        let again = connector().update(&state).await.unwrap();
        assert!(again.operations.is_empty());
        assert_eq!(again.state, out.state);
    }

    #[tokio::test]
    async fn foreign_or_garbled_state_is_rejected() {
        let label = SyncState::initial(RecordKind::Label, None);
        let err = connector()
            .update(&serde_json::to_value(&label).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::StateMismatch { .. }));

        let err = connector()
            .update(&json!({"record_kind": "recall", "cursor": "yesterday"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidState(_)));
    }

    #[test]
    fn invalid_page_size_is_a_config_error() {
        let mut config = ConnectorConfig::new(RecordKind::Label);
        config.page_size = 0;
        let err = Connector::new(config, Box::new(OnePage)).unwrap_err();
        assert!(matches!(err, ConnectorError::Config(_)));
    }
}
