//! End-to-end request scenarios: correlation, isolation, propagation into
//! sub-tasks and error cascades across layers.

#![allow(clippy::similar_names)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqscope::config::FinalizeGraceMs;
use reqscope::context::{self, RequestFields};
use reqscope::sink::MemorySink;
use reqscope::types::SessionId;
use reqscope::{
    Coordinator, Direction, Layer, LogLevel, ObservabilityConfig, RecordKind, UnifiedLogger,
};
use serde_json::{json, Value};
use tokio::sync::{oneshot, Barrier};

#[derive(Debug, thiserror::Error)]
#[error("inventory lookup failed for sku {0}")]
struct LookupFailed(u32);

fn coordinator() -> (Coordinator, Arc<MemorySink>) {
    let memory = Arc::new(MemorySink::new());
    let coordinator = Coordinator::builder()
        .config(ObservabilityConfig::default().with_log_level(LogLevel::Debug))
        .sink(memory.clone())
        .build()
        .unwrap();
    (coordinator, memory)
}

#[tokio::test]
async fn slow_domain_step_is_the_only_violation() {
    let (coordinator, memory) = coordinator();
    let api = coordinator.logger("http", Layer::Api);
    let domain = coordinator.logger("pricing", Layer::Domain);

    let fields = RequestFields::new().with_session_id(SessionId::try_new("session-42").unwrap());
    let (total, summary) = coordinator
        .run_request(fields, |ctx| async move {
            api.log_boundary("quote", Direction::Inbound, json!({"method": "POST"}));
            let prices = domain
                .operation("fetch", |_| async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, LookupFailed>(vec![3_u32, 4, 5])
                })
                .await
                .unwrap();
            let total = domain
                .operation("compute", |scope| async move {
                    tokio::time::sleep(Duration::from_millis(400)).await;
                    scope.record("items", prices.len());
                    Ok::<_, LookupFailed>(prices.iter().sum::<u32>())
                })
                .await
                .unwrap();
            api.log_boundary("quote", Direction::Outbound, json!({"status": 200}));

            assert_eq!(ctx.performance().violation_count(), 1);
            total
        })
        .await;

    assert_eq!(total, 12);
    assert_eq!(summary.session_id.as_deref(), Some("session-42"));
    assert_eq!(summary.performance_violations, 1);
    assert!(summary.operations_logged >= 4);
    assert_eq!(summary.errors_encountered, 0);
    assert!(summary.duration_seconds >= 0.45);

    let correlation = summary.correlation_id.unwrap();
    let records = memory.records_for(correlation);
    assert!(records.len() >= 5);
    assert!(records.iter().all(|r| r.session_id.as_deref() == Some("session-42")));

    let compute = memory.records_with_key("domain.operation.compute");
    assert_eq!(compute[0].performance_violation, Some(true));
    let fetch = memory.records_with_key("domain.operation.fetch");
    assert_eq!(fetch[0].performance_violation, Some(false));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_never_share_context() {
    let (coordinator, memory) = coordinator();
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let coordinator = coordinator.clone();
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                let logger = coordinator.logger("worker", Layer::Service);
                coordinator
                    .run_request(RequestFields::new().with_attribute("worker", i), |ctx| async move {
                        barrier.wait().await;
                        logger.log_boundary("process", Direction::Inbound, Value::Null);
                        tokio::task::yield_now().await;
                        let seen = context::current().unwrap();
                        assert!(seen.ptr_eq(&ctx));
                        assert_eq!(seen.attribute("worker"), Some(json!(i)));
                        ctx.correlation_id()
                    })
                    .await
            })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        let (id, summary) = handle.await.unwrap();
        assert_eq!(summary.correlation_id, Some(id));
        assert_eq!(summary.operations_logged, 1);
        ids.push(id);
    }
    ids.sort_by_key(ToString::to_string);
    ids.dedup();
    assert_eq!(ids.len(), 8);

    for id in ids {
        let boundaries: Vec<_> = memory
            .records_for(id)
            .into_iter()
            .filter(|r| r.kind == RecordKind::Boundary)
            .collect();
        assert_eq!(boundaries.len(), 1);
    }
}

#[tokio::test]
async fn spawned_sub_operations_share_correlation_and_dedup() {
    let (coordinator, memory) = coordinator();
    let service = coordinator.logger("fanout", Layer::Service);

    let (parent, summary) = coordinator
        .run_request(RequestFields::new(), |ctx| async move {
            let subtasks = ["left", "right"].map(|branch| {
                let service = service.clone();
                context::spawn(async move {
                    service.log_boundary("fanout", Direction::Inbound, Value::Null);
                    service
                        .operation(branch, |_| async {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            Ok::<_, LookupFailed>(context::current().map(|c| c.correlation_id()))
                        })
                        .await
                        .unwrap()
                })
            });
            for handle in subtasks {
                assert_eq!(handle.await.unwrap(), Some(ctx.correlation_id()));
            }
            ctx.correlation_id()
        })
        .await;

    assert_eq!(summary.correlation_id, Some(parent));
    assert_eq!(summary.operations_logged, 3);
    assert_eq!(
        memory
            .records_with_key("service.boundary.fanout.inbound")
            .len(),
        1
    );
    for branch in ["left", "right"] {
        let completion = memory.records_with_key(&format!("service.operation.{branch}"));
        assert_eq!(completion.len(), 1);
        assert_eq!(completion[0].correlation_id, Some(parent));
    }
    assert!(memory
        .records_for(parent)
        .iter()
        .all(|r| !r.orphaned));
}

#[tokio::test(flavor = "current_thread")]
async fn unscoped_tasks_never_see_each_others_context() {
    let (coordinator, _memory) = coordinator();
    let (started, announced) = oneshot::channel();

    let request = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let ctx = coordinator.start_request(RequestFields::new());
            started.send(ctx.correlation_id()).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            coordinator.finish(&ctx).await
        })
    };
    let bystander = tokio::spawn(async move {
        let id = announced.await.unwrap();
        (id, context::current().map(|c| c.correlation_id()))
    });

    let (id, seen) = bystander.await.unwrap();
    assert_eq!(seen, None);
    let summary = request.await.unwrap();
    assert_eq!(summary.correlation_id, Some(id));
    assert!(context::current().is_none());
}

#[tokio::test]
async fn late_child_work_keeps_its_correlation_during_the_grace_window() {
    let (coordinator, memory) = coordinator();
    let worker = coordinator.logger("worker", Layer::Service);

    let (parent, summary) = coordinator
        .run_request(RequestFields::new(), |ctx| async move {
            context::spawn(async move {
                let guard = worker.start_operation("child");
                tokio::time::sleep(Duration::from_millis(30)).await;
                worker.log_boundary("child_step", Direction::Inbound, Value::Null);
                guard.succeed();
            });
            tokio::task::yield_now().await;
            ctx.correlation_id()
        })
        .await;

    assert_eq!(summary.in_flight_at_close, 0);
    assert_eq!(summary.operations_logged, 2);
    let step = memory.records_with_key("service.boundary.child_step.inbound");
    assert_eq!(step.len(), 1);
    assert_eq!(step[0].correlation_id, Some(parent));
    assert!(!step[0].orphaned);
}

#[tokio::test]
async fn timed_out_request_lets_children_finish() {
    let (coordinator, memory) = coordinator();
    let worker = coordinator.logger("reconciler", Layer::Domain);

    let started = Instant::now();
    let (timed_out, summary) = coordinator
        .run_request(RequestFields::new(), |_| async move {
            tokio::time::timeout(Duration::from_millis(10), async move {
                context::spawn(async move {
                    worker
                        .operation("reconcile", |_| async {
                            tokio::time::sleep(Duration::from_millis(60)).await;
                            Ok::<_, LookupFailed>(())
                        })
                        .await
                })
                .await
            })
            .await
            .is_err()
        })
        .await;

    assert!(timed_out);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(summary.in_flight_at_close, 0);
    assert_eq!(summary.operations_logged, 1);

    let completion = memory.records_with_key("domain.operation.reconcile");
    assert_eq!(completion.len(), 1);
    assert_eq!(completion[0].field("status"), Some(&json!("success")));
    assert!(!completion[0].orphaned);
}

#[tokio::test]
async fn cancelled_request_ends_after_the_grace_period() {
    let memory = Arc::new(MemorySink::new());
    let coordinator = Coordinator::builder()
        .config(
            ObservabilityConfig::default()
                .with_finalize_grace(FinalizeGraceMs::try_new(30).unwrap()),
        )
        .sink(memory.clone())
        .build()
        .unwrap();
    let worker = coordinator.logger("exporter", Layer::Service);

    let started = Instant::now();
    let (child, summary) = coordinator
        .run_request(RequestFields::new(), |_| async move {
            let child = context::spawn(async move {
                worker
                    .operation("export", |_| async {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        Ok::<_, LookupFailed>(())
                    })
                    .await
            });
            let _ = tokio::time::timeout(
                Duration::from_millis(10),
                std::future::pending::<()>(),
            )
            .await;
            child
        })
        .await;

    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(summary.in_flight_at_close, 1);
    assert_eq!(memory.records_of_kind(RecordKind::Summary).len(), 1);

    child.await.unwrap().unwrap();
    let late = memory.records_with_key("service.operation.export");
    assert_eq!(late.len(), 1);
    assert!(late[0].orphaned);
    assert_eq!(late[0].correlation_id, summary.correlation_id);
    assert_eq!(late[0].field("status"), Some(&json!("success")));
}

#[tokio::test]
async fn error_cascade_is_counted_per_layer_but_detailed_once() {
    let (coordinator, memory) = coordinator();
    let api = coordinator.logger("http", Layer::Api);
    let service = coordinator.logger("orders", Layer::Service);
    let domain = coordinator.logger("inventory", Layer::Domain);

    let (result, summary) = coordinator
        .run_request(RequestFields::new(), |_| async {
            api.operation("place_order", |_| async {
                service
                    .operation("reserve", |_| async {
                        domain
                            .operation("lookup", |_| async { Err::<(), _>(LookupFailed(7)) })
                            .await
                    })
                    .await
            })
            .await
        })
        .await;

    let error = result.unwrap_err();
    assert_eq!(error.0, 7);
    assert_eq!(summary.errors_encountered, 3);

    let detailed = memory.records_of_kind(RecordKind::Error);
    assert_eq!(detailed.len(), 1);
    assert_eq!(detailed[0].layer, Layer::Domain);
    assert_eq!(
        detailed[0].error.as_deref(),
        Some("inventory lookup failed for sku 7")
    );
}

#[test]
fn synchronous_servers_use_the_thread_slot() {
    let (coordinator, memory) = coordinator();
    let logger: UnifiedLogger = coordinator.logger("legacy", "handler");

    let ctx = coordinator.start_request(RequestFields::new());
    assert!(!context::in_scope());
    assert!(context::current().unwrap().ptr_eq(&ctx));
    logger.log_boundary("render", Direction::Inbound, Value::Null);
    logger.log_boundary("render", Direction::Inbound, Value::Null);

    let summary = coordinator.end_request_now();
    assert_eq!(summary.operations_logged, 1);
    assert!(context::current().is_none());
    assert_eq!(memory.records_of_kind(RecordKind::Summary).len(), 1);

    let again = coordinator.end_request_now();
    assert!(again.is_empty());
}
