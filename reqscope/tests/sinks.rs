//! Output sinks wired through a coordinator.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqscope::context::RequestFields;
use reqscope::errors::SinkError;
use reqscope::sink::{CollectorTransport, FileSink, MemorySink, RemoteSink, Sink};
use reqscope::{
    Coordinator, Direction, HealthState, Layer, LogLevel, LogRecord, ObservabilityConfig,
    RecordKind,
};
use serde_json::{json, Value};
use tempfile::TempDir;

#[derive(Debug)]
struct Unreachable;

impl Sink for Unreachable {
    fn name(&self) -> &str {
        "unreachable"
    }

    fn emit(&self, _record: &LogRecord) -> Result<(), SinkError> {
        Err(SinkError::Transport("collector unreachable".to_string()))
    }
}

struct RefusingCollector;

#[async_trait::async_trait]
impl CollectorTransport for RefusingCollector {
    async fn send(&self, _batch: Vec<Value>) -> Result<(), SinkError> {
        Err(SinkError::Transport("connection refused".to_string()))
    }
}

fn read_lines(files: &[PathBuf]) -> Vec<Value> {
    files
        .iter()
        .flat_map(|path| {
            fs::read_to_string(path)
                .unwrap()
                .lines()
                .map(|line| serde_json::from_str(line).unwrap())
                .collect::<Vec<Value>>()
        })
        .collect()
}

#[test]
fn file_sink_rotates_and_keeps_bounded_history() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("logs").join("requests.jsonl");
    let sink = FileSink::with_rotation(&path, 400, 2).unwrap();

    for i in 0..30 {
        let record = LogRecord::new(
            LogLevel::Info,
            RecordKind::Event,
            format!("event {i}"),
            "rotation",
            &Layer::Service,
        )
        .with_field("sequence", json!(i));
        sink.emit(&record).unwrap();
    }
    sink.flush().unwrap();

    let files = sink.files().unwrap();
    assert!(files.len() >= 2);
    assert!(files.len() <= 3);

    let lines = read_lines(&files);
    assert!(!lines.is_empty());
    assert!(lines.len() < 30);
    let newest = lines.iter().filter(|l| l["message"] == "event 29").count();
    assert_eq!(newest, 1);
    assert!(lines.iter().all(|l| l["fields"]["sequence"].is_u64()));
}

#[tokio::test]
async fn buffered_file_output_is_drained_on_flush() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("requests.jsonl");
    let file = Arc::new(FileSink::new(&path).unwrap());

    let coordinator = Coordinator::builder()
        .config(ObservabilityConfig::default())
        .sink(file.clone())
        .buffered(true)
        .build()
        .unwrap();
    let logger = coordinator.logger("checkout", Layer::Api);

    let (id, _summary) = coordinator
        .run_request(RequestFields::new(), |ctx| async move {
            logger.log_boundary("pay", Direction::Inbound, json!({"amount": 10}));
            ctx.correlation_id()
        })
        .await;
    coordinator.flush().await;

    let lines = read_lines(&file.files().unwrap());
    assert_eq!(lines.len(), 2);
    assert!(lines
        .iter()
        .all(|line| line["correlation_id"] == id.to_string()));
    assert_eq!(lines[0]["key"], "api.boundary.pay.inbound");
    assert_eq!(lines[1]["kind"], "summary");
}

#[tokio::test]
async fn failing_sink_falls_back_without_disturbing_the_request() {
    let fallback = Arc::new(MemorySink::new());
    let coordinator = Coordinator::builder()
        .sink(Arc::new(Unreachable))
        .fallback(fallback.clone())
        .build()
        .unwrap();
    let logger = coordinator.logger("search", Layer::Service);

    let (value, summary) = coordinator
        .run_request(RequestFields::new(), |_| async {
            logger.log_boundary("query", Direction::Inbound, Value::Null);
            5
        })
        .await;

    assert_eq!(value, 5);
    assert_eq!(summary.operations_logged, 1);
    assert_eq!(fallback.len(), 2);
    assert_eq!(coordinator.get_health_status().status, HealthState::Healthy);
}

#[tokio::test]
async fn dropped_records_degrade_health() {
    let coordinator = Coordinator::builder()
        .sink(Arc::new(Unreachable))
        .build()
        .unwrap();
    let logger = coordinator.logger("search", Layer::Service);

    coordinator
        .run_request(RequestFields::new(), |_| async {
            logger.log_boundary("query", Direction::Inbound, Value::Null);
        })
        .await;

    let health = coordinator.get_health_status();
    assert_eq!(health.status, HealthState::Degraded);
    assert_eq!(health.dropped_records, 2);
    assert_eq!(health.requests_completed, 1);
}

#[tokio::test]
async fn lost_remote_batches_degrade_health() {
    let coordinator = Coordinator::builder()
        .sink(Arc::new(RemoteSink::new("collector", RefusingCollector, 1)))
        .build()
        .unwrap();
    let logger = coordinator.logger("search", Layer::Service);

    coordinator
        .run_request(RequestFields::new(), |_| async {
            logger.log_boundary("query", Direction::Inbound, Value::Null);
        })
        .await;

    let mut health = coordinator.get_health_status();
    for _ in 0..50 {
        if health.dropped_records == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        health = coordinator.get_health_status();
    }
    assert_eq!(health.dropped_records, 2);
    assert_eq!(health.status, HealthState::Degraded);
}
