use chrono::NaiveDate;
use serde_json::{json, Value};
use std::time::Instant;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fda_sync::config::{ConnectorConfig, OpenFda};
use fda_sync::connector::{schema, Connector, Operation, UpdateOutcome};
use fda_sync::model::{ColumnType, RecordKind};
use fda_sync::sync::StopReason;

fn settings(server: &MockServer) -> OpenFda {
    OpenFda {
        base_url: server.uri(),
        timeout_secs: 5,
        requests_per_minute: Some(1000),
        max_attempts: 5,
        backoff_base_ms: 10,
        backoff_cap_secs: 1,
        ..OpenFda::default()
    }
}

fn recalls_config() -> ConnectorConfig {
    ConnectorConfig {
        record_kind: RecordKind::Recall,
        api_key: None,
        start_date: NaiveDate::from_ymd_opt(2024, 1, 1),
        page_size: 100,
    }
}

fn recall(number: Option<&str>, date: &str) -> Value {
    let mut raw = json!({
        "report_date": date,
        "product_description": "Peanut butter cups",
        "reason_for_recall": "Undeclared milk",
        "recalling_firm": "Acme Foods",
        "classification": "Class I",
        "status": "Ongoing",
        "distribution_pattern": "Nationwide"
    });
    if let Some(number) = number {
        raw["recall_number"] = json!(number);
    }
    raw
}

fn page(results: Vec<Value>) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "meta": { "results": { "skip": 0, "limit": 100, "total": results.len() } },
        "results": results
    }))
}

#[test]
fn schema_describes_destination_table() {
    let schema = schema(&recalls_config());
    assert_eq!(schema.table, "fda_food_recalls");
    assert_eq!(schema.primary_key, vec!["recall_number"]);
    assert_eq!(schema.columns[0].name, "recall_number");
    assert_eq!(schema.columns.last().unwrap().ty, ColumnType::Timestamp);

    let value = serde_json::to_value(fda_sync::connector::schema(&ConnectorConfig::new(
        RecordKind::AdverseEvent,
    )))
    .unwrap();
    assert_eq!(value["table"], "fda_drug_adverse_events");
    assert_eq!(value["primary_key"], json!(["safetyreportid"]));
    assert!(value["columns"]
        .as_array()
        .unwrap()
        .contains(&json!({"name": "patient_age", "type": "FLOAT"})));
}

#[tokio::test]
async fn update_streams_rows_then_checkpoint_and_resumes_from_state() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/food/enforcement.json"))
        .and(query_param("search", "report_date:[20240101 TO 99991231]"))
        .and(query_param("sort", "report_date:asc"))
        .and(query_param("skip", "0"))
        .respond_with(page(vec![
            recall(Some("F-0001-2024"), "20240103"),
            recall(None, "20240104"),
            recall(Some("F-0003-2024"), "20240104"),
        ]))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/food/enforcement.json"))
        .and(query_param("search", "report_date:[20240104 TO 99991231]"))
        .and(query_param("skip", "2"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": { "code": "NOT_FOUND", "message": "No matches found!" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let connector = Connector::from_settings(recalls_config(), &settings(&server)).unwrap();
    let first = connector.update(&Value::Null).await.unwrap();

    assert_eq!(
        first.outcome,
        UpdateOutcome::Done {
            pages: 1,
            emitted: 2,
            skipped: 1,
            stop: StopReason::Exhausted
        }
    );
    let kinds: Vec<&str> = first
        .operations
        .iter()
        .map(|op| match op {
            Operation::Upsert { .. } => "upsert",
            Operation::Checkpoint { .. } => "checkpoint",
        })
        .collect();
    assert_eq!(kinds, vec!["upsert", "upsert", "checkpoint"]);
    match &first.operations[0] {
        Operation::Upsert { table, row } => {
            assert_eq!(table, "fda_food_recalls");
            assert_eq!(row["recall_number"], "F-0001-2024");
            assert_eq!(row["company_name"], "Acme Foods");
        }
        other => panic!("unexpected operation {:?}", other),
    }
    assert_eq!(first.state.cursor.to_string(), "20240104:2");

    let state = serde_json::to_value(&first.state).unwrap();
    assert_eq!(state["record_kind"], "recall");
    let second = connector.update(&state).await.unwrap();
    assert!(second.operations.is_empty());
    assert!(second.outcome.is_done());
    assert_eq!(second.state, first.state);
}

#[tokio::test]
async fn rate_limited_page_completes_after_backoff() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/food/enforcement.json"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(3)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/food/enforcement.json"))
        .respond_with(page(vec![recall(Some("F-1"), "20240110")]))
        .with_priority(2)
        .mount(&server)
        .await;

    let mut settings = settings(&server);
    settings.backoff_base_ms = 20;
    let connector = Connector::from_settings(recalls_config(), &settings).unwrap();
    let started = Instant::now();
    let out = connector.update(&json!({})).await.unwrap();

    assert!(out.outcome.is_done());
    assert_eq!(out.operations.len(), 2);
    // Equal jitter sleeps at least half of 20ms, 40ms and 80ms.
    assert!(started.elapsed().as_millis() >= 70);
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 4);
}

#[tokio::test]
async fn rejected_request_fails_without_operations() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/food/enforcement.json"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "code": "BAD_REQUEST", "message": "Invalid search" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let connector = Connector::from_settings(recalls_config(), &settings(&server)).unwrap();
    let out = connector.update(&Value::Null).await.unwrap();

    assert!(out.operations.is_empty());
    match out.outcome {
        UpdateOutcome::Failed { retryable, .. } => assert!(!retryable),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(out.state.cursor.to_string(), "20240101:0");
}

#[tokio::test]
async fn exhausted_retries_report_retryable_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/food/enforcement.json"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut settings = settings(&server);
    settings.max_attempts = 2;
    let connector = Connector::from_settings(recalls_config(), &settings).unwrap();
    let out = connector.update(&Value::Null).await.unwrap();

    match out.outcome {
        UpdateOutcome::Failed { retryable, .. } => assert!(retryable),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}
