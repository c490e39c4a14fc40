//! Maps raw openFDA result objects onto the fixed per-kind schemas.
//!
//! Pure functions: no I/O and the page is never mutated. Absent or mistyped
//! text fields become `""`, absent numbers and flags become `None`; values are
//! never coerced from one JSON type into another, except numeric strings for
//! ages (openFDA ships every scalar as a string).
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::model::{
    AdverseEvent, DeviceEvent, Label, NormalizedRecord, RawPage, Recall, RecordKind,
};

static OPENFDA_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{8}$").unwrap());
static DECIMAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+(\.\d+)?$").unwrap());

/// Usable records of one page plus the number dropped for lacking a key.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedPage {
    pub records: Vec<NormalizedRecord>,
    pub skipped: usize,
}

pub fn map_page(kind: RecordKind, page: &RawPage) -> MappedPage {
    let mut records = Vec::with_capacity(page.records.len());
    let mut skipped = 0;
    for raw in &page.records {
        match map_record(kind, raw, page.fetched_at) {
            Some(record) => records.push(record),
            None => skipped += 1,
        }
    }
    MappedPage { records, skipped }
}

/// `None` when the record has no usable primary key.
pub fn map_record(
    kind: RecordKind,
    raw: &Value,
    fetched_at: DateTime<Utc>,
) -> Option<NormalizedRecord> {
    let key = primary_key(raw, kind.primary_key())?;
    let record = match kind {
        RecordKind::AdverseEvent => NormalizedRecord::AdverseEvent(adverse_event(raw, key, fetched_at)),
        RecordKind::Label => NormalizedRecord::Label(label(raw, key, fetched_at)),
        RecordKind::Recall | RecordKind::DrugRecall => {
            NormalizedRecord::Recall(recall(raw, key, fetched_at))
        }
        RecordKind::DeviceEvent => NormalizedRecord::DeviceEvent(device_event(raw, key, fetched_at)),
    };
    Some(record)
}

fn adverse_event(raw: &Value, report_id: String, fetched_at: DateTime<Utc>) -> AdverseEvent {
    let patient = raw.get("patient").unwrap_or(&Value::Null);
    AdverseEvent {
        report_id,
        received_date: date(raw, "receivedate"),
        patient_age: decimal(patient, "patientonsetage"),
        patient_sex: text(patient, "patientsex"),
        is_serious: match raw.get("serious").and_then(Value::as_str) {
            Some("1") => Some(true),
            Some("2") => Some(false),
            _ => None,
        },
        serious_death: flag(raw, "seriousnessdeath"),
        serious_hospitalization: flag(raw, "seriousnesshospitalization"),
        drug_names: pluck(patient, "drug", "medicinalproduct"),
        reactions: pluck(patient, "reaction", "reactionmeddrapt"),
        fetched_at,
    }
}

fn label(raw: &Value, id: String, fetched_at: DateTime<Utc>) -> Label {
    let openfda = raw.get("openfda").unwrap_or(&Value::Null);
    Label {
        id,
        effective_time: date(raw, "effective_time"),
        product_names: strings(openfda, "brand_name"),
        generic_names: strings(openfda, "generic_name"),
        manufacturers: strings(openfda, "manufacturer_name"),
        indications_and_usage: strings(raw, "indications_and_usage").join(" "),
        warnings: strings(raw, "warnings").join(" "),
        dosage_and_administration: strings(raw, "dosage_and_administration").join(" "),
        fetched_at,
    }
}

fn recall(raw: &Value, recall_number: String, fetched_at: DateTime<Utc>) -> Recall {
    Recall {
        recall_number,
        report_date: date(raw, "report_date"),
        product_description: text(raw, "product_description"),
        reason_for_recall: text(raw, "reason_for_recall"),
        company_name: text(raw, "recalling_firm"),
        classification: text(raw, "classification"),
        status: text(raw, "status"),
        distribution_pattern: text(raw, "distribution_pattern"),
        fetched_at,
    }
}

fn device_event(raw: &Value, mdr_report_key: String, fetched_at: DateTime<Utc>) -> DeviceEvent {
    let patient_problems = raw
        .get("patient")
        .and_then(Value::as_array)
        .map(|patients| {
            patients
                .iter()
                .flat_map(|p| strings(p, "patient_problems"))
                .collect()
        })
        .unwrap_or_default();

    DeviceEvent {
        mdr_report_key,
        report_number: text(raw, "report_number"),
        date_received: date(raw, "date_received"),
        device_names: pluck(raw, "device", "generic_name"),
        manufacturers: pluck(raw, "device", "manufacturer_d_name"),
        event_type: text(raw, "event_type"),
        adverse_event_flag: text(raw, "adverse_event_flag"),
        patient_problems,
        fetched_at,
    }
}

fn primary_key(raw: &Value, field: &str) -> Option<String> {
    raw.get(field)
        .and_then(Value::as_str)
        .filter(|key| !key.trim().is_empty())
        .map(str::to_string)
}

fn text(raw: &Value, field: &str) -> String {
    raw.get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn date(raw: &Value, field: &str) -> String {
    raw.get(field)
        .and_then(Value::as_str)
        .filter(|d| OPENFDA_DATE.is_match(d))
        .unwrap_or_default()
        .to_string()
}

fn decimal(raw: &Value, field: &str) -> Option<f64> {
    match raw.get(field)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if DECIMAL.is_match(s.trim()) => s.trim().parse().ok(),
        _ => None,
    }
}

/// openFDA seriousness sub-flags are `"1"` when set and absent otherwise.
fn flag(raw: &Value, field: &str) -> Option<bool> {
    match raw.get(field).and_then(Value::as_str) {
        Some("1") => Some(true),
        _ => None,
    }
}

/// Non-empty string items of an array field, in order.
fn strings(raw: &Value, field: &str) -> Vec<String> {
    raw.get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// `field` of every object in array `list`, in order.
fn pluck(raw: &Value, list: &str, field: &str) -> Vec<String> {
    raw.get(list)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get(field).and_then(Value::as_str))
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
