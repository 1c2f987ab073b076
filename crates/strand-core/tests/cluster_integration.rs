//! Cluster fan-out through the public API with in-process workers.

use serde_json::{json, Value};
use std::time::Duration;
use strand_core::cluster::{ClusterMessage, ClusterWorker};
use strand_core::{CommandHandlers, PrimaryHandle, RpcError};

fn worker_handlers() -> CommandHandlers {
    let mut handlers = CommandHandlers::new();
    handlers
        .register("report", |env, _payload| async move {
            Ok(json!({"worker": env.worker_id, "uids": env.uids}))
        })
        .register("flaky", |env, _payload| async move {
            if env.worker_id == Some(2) {
                return Err(RpcError::handler_with_code("disk unavailable", "EIO"));
            }
            Ok(json!("ok"))
        })
        .register("slowReport", |env, _payload| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(json!(env.worker_id))
        })
        .register("brittle", |env, _payload| async move {
            if env.worker_id == Some(2) {
                panic!("worker 2 lost its state");
            }
            Ok(json!("ok"))
        });
    handlers
}

fn primary_handlers() -> CommandHandlers {
    let mut handlers = CommandHandlers::new();
    handlers
        .register("clusterSize", |_env, payload| async move {
            Ok(json!({"asked": payload, "size": "unknown"}))
        })
        .register("explode", |_env, payload| async move {
            if payload.is_null() {
                panic!("primary handler gave up");
            }
            Ok(payload)
        });
    handlers
}

async fn start_cluster(size: usize) -> (PrimaryHandle, Vec<ClusterWorker>) {
    let primary = PrimaryHandle::start(primary_handlers());
    let mut workers = Vec::with_capacity(size);
    for _ in 0..size {
        let link = primary.attach_worker().await.unwrap();
        workers.push(ClusterWorker::start(link, worker_handlers()));
    }
    (primary, workers)
}

#[tokio::test]
async fn test_fan_out_yields_one_entry_per_worker() {
    let (primary, workers) = start_cluster(4).await;
    let results = workers[2]
        .send_command("fan-1", "*", "report", Value::Null, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(results.len(), 4);
    for (index, outcome) in results.iter().enumerate() {
        assert!(!outcome.is_error());
        assert_eq!(outcome.result["worker"], json!(index + 1));
        assert_eq!(outcome.result["uids"], json!("fan-1"));
    }
    assert_eq!(primary.in_flight().await.unwrap(), 0);
}

#[tokio::test]
async fn test_one_failing_worker_does_not_abort_the_rest() {
    let (_primary, workers) = start_cluster(3).await;
    let results = workers[0]
        .send_command("iso-1", "*", "flaky", Value::Null, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    let failures: Vec<_> = results.iter().filter(|r| r.is_error()).collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].error_code.as_deref(), Some("EIO"));
    assert_eq!(
        failures[0].error.as_ref().map(|e| e.message.as_str()),
        Some("disk unavailable")
    );
}

#[tokio::test]
async fn test_worker_joining_after_dispatch_is_not_waited_for() {
    let (primary, workers) = start_cluster(2).await;
    let command = workers[0].send_command(
        "late-1",
        "*",
        "slowReport",
        Value::Null,
        Duration::from_secs(2),
    );
    let join_late = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let link = primary.attach_worker().await.unwrap();
        ClusterWorker::start(link, worker_handlers())
    };
    let (results, _late_worker) = tokio::join!(command, join_late);
    let results = results.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(primary.worker_ids().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_duplicate_uids_fails_immediately() {
    let (_primary, workers) = start_cluster(2).await;
    let worker = &workers[1];
    let first = worker.send_command("dup-1", "*", "slowReport", Value::Null, Duration::from_secs(2));
    let second = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let started = std::time::Instant::now();
        let outcome = worker
            .send_command("dup-1", "*", "report", Value::Null, Duration::from_secs(2))
            .await;
        (outcome, started.elapsed())
    };
    let (first, (second, elapsed)) = tokio::join!(first, second);

    assert_eq!(first.unwrap().len(), 2);
    assert!(matches!(second, Err(RpcError::DuplicateUids { .. })));
    assert!(elapsed < Duration::from_millis(50));
}

#[tokio::test]
async fn test_primary_target_returns_single_outcome() {
    let (_primary, workers) = start_cluster(2).await;
    let results = workers[0]
        .send_command("p-1", "PRIMARY", "clusterSize", json!("now"), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].result["asked"], json!("now"));

    let missing = workers[0]
        .send_command("p-2", "PRIMARY", "nothing", Value::Null, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(missing[0].error_code.as_deref(), Some("NotImplemented"));
}

#[tokio::test]
async fn test_exiting_worker_still_lets_command_complete() {
    let (primary, mut workers) = start_cluster(3).await;
    let leaving = workers.pop().unwrap();
    let leaving_id = leaving.worker_id();

    let command = workers[0].send_command(
        "exit-1",
        "*",
        "slowReport",
        Value::Null,
        Duration::from_secs(2),
    );
    let leave = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(leaving);
    };
    let (results, _) = tokio::join!(command, leave);
    let results = results.unwrap();

    assert_eq!(results.len(), 3);
    let last = &results[2];
    assert_eq!(last.error_code.as_deref(), Some("WorkerExited"));
    assert!(!primary.worker_ids().await.unwrap().contains(&leaving_id));
}

#[tokio::test]
async fn test_panicking_handler_is_reported_and_command_completes() {
    let (primary, workers) = start_cluster(3).await;
    let results = workers[0]
        .send_command("panic-1", "*", "brittle", Value::Null, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].result, json!("ok"));
    assert_eq!(results[1].error_code.as_deref(), Some("HandlerPanic"));
    assert_eq!(results[2].result, json!("ok"));
    assert_eq!(primary.in_flight().await.unwrap(), 0);

    // The panicking worker keeps serving later commands.
    let again = workers[1]
        .send_command("panic-2", "*", "report", Value::Null, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(again.iter().all(|r| !r.is_error()));
}

#[tokio::test]
async fn test_panicking_primary_handler_replies_with_error() {
    let (_primary, workers) = start_cluster(1).await;
    let results = workers[0]
        .send_command("panic-p", "PRIMARY", "explode", Value::Null, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].error_code.as_deref(), Some("HandlerPanic"));
}

#[tokio::test]
async fn test_aggregate_for_exited_originator_is_dropped() {
    let (primary, _workers) = start_cluster(2).await;
    let origin = primary.attach_worker().await.unwrap();
    origin
        .outbound
        .send(ClusterMessage::Command {
            uids: "gone-1".into(),
            to_workers: "*".into(),
            to_handler: "slowReport".into(),
            payload: Value::Null,
        })
        .unwrap();
    drop(origin);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(primary.in_flight().await.unwrap(), 1);
    assert_eq!(primary.worker_ids().await.unwrap().len(), 2);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(primary.in_flight().await.unwrap(), 0);
}

#[tokio::test]
async fn test_primary_rejects_uids_in_flight_from_another_worker() {
    let (primary, workers) = start_cluster(2).await;
    let first = workers[0].send_command(
        "shared-1",
        "*",
        "slowReport",
        Value::Null,
        Duration::from_secs(2),
    );
    let second = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        workers[1]
            .send_command("shared-1", "*", "report", Value::Null, Duration::from_secs(2))
            .await
    };
    let (first, second) = tokio::join!(first, second);

    assert_eq!(first.unwrap().len(), 2);
    let err = second.unwrap_err();
    assert_eq!(err.code(), "DuplicateUids");
    assert_eq!(workers[1].in_flight(), 0);
    assert_eq!(primary.in_flight().await.unwrap(), 0);
}
