//! Domain types shared by the fetcher, mapper, state store and orchestrator.
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::cursor::Cursor;

/// Ingestion stamp present in every destination table.
pub const FETCHED_AT_COLUMN: &str = "fetched_at";

/// openFDA data category. Each kind has its own endpoint, schema and cursor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    AdverseEvent,
    Label,
    Recall,
    DrugRecall,
    DeviceEvent,
}

impl RecordKind {
    pub const ALL: [RecordKind; 5] = [
        RecordKind::AdverseEvent,
        RecordKind::Label,
        RecordKind::Recall,
        RecordKind::DrugRecall,
        RecordKind::DeviceEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::AdverseEvent => "adverse_event",
            RecordKind::Label => "label",
            RecordKind::Recall => "recall",
            RecordKind::DrugRecall => "drug_recall",
            RecordKind::DeviceEvent => "device_event",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        RecordKind::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Endpoint path relative to the API base URL.
    pub fn endpoint(&self) -> &'static str {
        match self {
            RecordKind::AdverseEvent => "drug/event.json",
            RecordKind::Label => "drug/label.json",
            RecordKind::Recall => "food/enforcement.json",
            RecordKind::DrugRecall => "drug/enforcement.json",
            RecordKind::DeviceEvent => "device/event.json",
        }
    }

    /// Date field the cursor filters and sorts on (openFDA `YYYYMMDD`).
    pub fn date_field(&self) -> &'static str {
        match self {
            RecordKind::AdverseEvent => "receivedate",
            RecordKind::Label => "effective_time",
            RecordKind::Recall | RecordKind::DrugRecall => "report_date",
            RecordKind::DeviceEvent => "date_received",
        }
    }

    /// Source field holding the primary key; also the destination key column.
    pub fn primary_key(&self) -> &'static str {
        match self {
            RecordKind::AdverseEvent => "safetyreportid",
            RecordKind::Label => "id",
            RecordKind::Recall | RecordKind::DrugRecall => "recall_number",
            RecordKind::DeviceEvent => "mdr_report_key",
        }
    }

    pub fn table_name(&self) -> &'static str {
        match self {
            RecordKind::AdverseEvent => "fda_drug_adverse_events",
            RecordKind::Label => "fda_drug_labels",
            RecordKind::Recall => "fda_food_recalls",
            RecordKind::DrugRecall => "fda_drug_recalls",
            RecordKind::DeviceEvent => "fda_device_adverse_events",
        }
    }

    /// Destination table shape reported to the host.
    pub fn schema(&self) -> TableSchema {
        use ColumnType::*;
        let columns: &[(&'static str, ColumnType)] = match self {
            RecordKind::AdverseEvent => &[
                ("safetyreportid", String),
                ("receivedate", String),
                ("patient_age", Float),
                ("patient_sex", String),
                ("serious", Boolean),
                ("serious_death", Boolean),
                ("serious_hospitalization", Boolean),
                ("drug_names", Json),
                ("reactions", Json),
                (FETCHED_AT_COLUMN, Timestamp),
            ],
            RecordKind::Label => &[
                ("id", String),
                ("effective_time", String),
                ("product_names", Json),
                ("generic_names", Json),
                ("manufacturers", Json),
                ("indications_and_usage", String),
                ("warnings", String),
                ("dosage_and_administration", String),
                (FETCHED_AT_COLUMN, Timestamp),
            ],
            RecordKind::Recall | RecordKind::DrugRecall => &[
                ("recall_number", String),
                ("report_date", String),
                ("product_description", String),
                ("reason_for_recall", String),
                ("company_name", String),
                ("classification", String),
                ("status", String),
                ("distribution_pattern", String),
                (FETCHED_AT_COLUMN, Timestamp),
            ],
            RecordKind::DeviceEvent => &[
                ("mdr_report_key", String),
                ("report_number", String),
                ("date_received", String),
                ("device_names", Json),
                ("manufacturers", Json),
                ("event_type", String),
                ("adverse_event_flag", String),
                ("patient_problems", Json),
                (FETCHED_AT_COLUMN, Timestamp),
            ],
        };
        TableSchema {
            table: self.table_name(),
            primary_key: vec![self.primary_key()],
            columns: columns
                .iter()
                .map(|&(name, ty)| Column { name, ty })
                .collect(),
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordKind::parse_kind(s).ok_or_else(|| {
            let known: Vec<&str> = RecordKind::ALL.iter().map(|k| k.as_str()).collect();
            format!("unknown record kind '{}', expected one of: {}", s, known.join(", "))
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnType {
    String,
    Float,
    Boolean,
    Json,
    Timestamp,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    #[serde(rename = "type")]
    pub ty: ColumnType,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TableSchema {
    pub table: &'static str,
    pub primary_key: Vec<&'static str>,
    pub columns: Vec<Column>,
}

impl TableSchema {
    /// Columns carrying source data: everything except the key and the
    /// ingestion stamp. A row only changes when one of these does.
    pub fn content_columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns
            .iter()
            .map(|c| c.name)
            .filter(move |name| *name != FETCHED_AT_COLUMN && !self.primary_key.contains(name))
    }

    /// Whether two rows of this table agree on every content column.
    pub fn same_content(&self, a: &Value, b: &Value) -> bool {
        self.content_columns().all(|name| a.get(name) == b.get(name))
    }
}

/// Resume position for one record kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncState {
    pub record_kind: RecordKind,
    pub cursor: Cursor,
    #[serde(default)]
    pub last_success_time: Option<DateTime<Utc>>,
}

impl SyncState {
    /// Cold-start state: cursor at `start_date`, or at the beginning of data.
    pub fn initial(record_kind: RecordKind, start_date: Option<NaiveDate>) -> Self {
        Self {
            record_kind,
            cursor: Cursor::start(start_date),
            last_success_time: None,
        }
    }
}

/// One openFDA response page, as returned by the fetcher.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub records: Vec<Value>,
    pub has_more: bool,
    /// Query pairs used for the request, without the API key.
    pub fetch_params: Vec<(String, String)>,
    pub total: Option<u64>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AdverseEvent {
    #[serde(rename = "safetyreportid")]
    pub report_id: String,
    #[serde(rename = "receivedate")]
    pub received_date: String,
    pub patient_age: Option<f64>,
    pub patient_sex: String,
    #[serde(rename = "serious")]
    pub is_serious: Option<bool>,
    pub serious_death: Option<bool>,
    pub serious_hospitalization: Option<bool>,
    pub drug_names: Vec<String>,
    pub reactions: Vec<String>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Label {
    pub id: String,
    pub effective_time: String,
    pub product_names: Vec<String>,
    pub generic_names: Vec<String>,
    pub manufacturers: Vec<String>,
    pub indications_and_usage: String,
    pub warnings: String,
    pub dosage_and_administration: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Recall {
    pub recall_number: String,
    pub report_date: String,
    pub product_description: String,
    pub reason_for_recall: String,
    pub company_name: String,
    pub classification: String,
    pub status: String,
    pub distribution_pattern: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeviceEvent {
    pub mdr_report_key: String,
    pub report_number: String,
    pub date_received: String,
    pub device_names: Vec<String>,
    pub manufacturers: Vec<String>,
    pub event_type: String,
    pub adverse_event_flag: String,
    pub patient_problems: Vec<String>,
    pub fetched_at: DateTime<Utc>,
}

/// A source record mapped onto its kind's fixed schema.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedRecord {
    AdverseEvent(AdverseEvent),
    Label(Label),
    Recall(Recall),
    DeviceEvent(DeviceEvent),
}

impl NormalizedRecord {
    pub fn primary_key(&self) -> &str {
        match self {
            NormalizedRecord::AdverseEvent(r) => &r.report_id,
            NormalizedRecord::Label(r) => &r.id,
            NormalizedRecord::Recall(r) => &r.recall_number,
            NormalizedRecord::DeviceEvent(r) => &r.mdr_report_key,
        }
    }

    /// Destination row as a JSON object keyed by column name.
    pub fn to_row(&self) -> Result<Value, serde_json::Error> {
        match self {
            NormalizedRecord::AdverseEvent(r) => serde_json::to_value(r),
            NormalizedRecord::Label(r) => serde_json::to_value(r),
            NormalizedRecord::Recall(r) => serde_json::to_value(r),
            NormalizedRecord::DeviceEvent(r) => serde_json::to_value(r),
        }
    }
}
