//! `cluster` and `worker` subcommands.
//!
//! `cluster` runs the primary in this process and spawns every worker as a
//! child running `strand-rpc worker`. The last worker spawned originates the
//! command, so every other worker is already attached when it is sent. It
//! hands the aggregate back to the primary through the `report` handler.

use anyhow::{anyhow, Context};
use serde_json::{json, Value};
use std::time::Duration;
use strand_core::cluster::{spawn_worker_process, stdio_link};
use strand_core::{ClusterConfig, ClusterWorker, CommandHandlers, PrimaryHandle, RpcError};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Primary handler the originating worker delivers its aggregate to.
const REPORT_HANDLER: &str = "report";

/// Extra time the primary waits for a report past the command timeout.
const REPORT_GRACE: Duration = Duration::from_secs(5);

/// A command a worker process sends as soon as it starts.
#[derive(Debug, Clone)]
pub struct Originate {
    pub uids: String,
    pub handler: String,
    pub payload: Value,
    pub timeout: Duration,
}

/// Handlers every worker process serves.
pub fn worker_handlers() -> CommandHandlers {
    let mut handlers = CommandHandlers::new();
    handlers
        .register("stats", |env, _payload| async move {
            Ok(json!({
                "workerId": env.worker_id,
                "pid": std::process::id(),
            }))
        })
        .register("echo", |_env, payload| async move { Ok(payload) })
        .register("sleep", |_env, payload| async move {
            let ms = payload.as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!(ms))
        })
        .register("fail", |env, _payload| async move {
            Err(RpcError::handler_with_code(
                format!("worker {:?} refused", env.worker_id),
                "Refused",
            ))
        });
    handlers
}

/// Run `handler` on `workers` child processes and return the aggregate.
pub async fn run_cluster(
    workers: usize,
    handler: &str,
    payload: Value,
    timeout: Duration,
    debug_logging: bool,
) -> anyhow::Result<Value> {
    anyhow::ensure!(workers > 0, "cluster needs at least one worker");

    let (report_tx, mut report_rx) = mpsc::unbounded_channel();
    let mut handlers = CommandHandlers::new();
    handlers.register(REPORT_HANDLER, move |env, report| {
        let report_tx = report_tx.clone();
        async move {
            debug!("Report {} received", env.uids);
            let _ = report_tx.send(report);
            Ok(json!("received"))
        }
    });
    let primary = PrimaryHandle::start(handlers);

    let exe = std::env::current_exe().context("cannot locate the strand-rpc binary")?;
    let uids = format!("cli-{}", std::process::id());
    let mut processes = Vec::with_capacity(workers);
    for index in 0..workers {
        let mut command = Command::new(&exe);
        if debug_logging {
            command.arg("--debug");
        }
        command.arg("worker");
        if index + 1 == workers {
            command
                .arg("--originate")
                .arg(handler)
                .arg("--uids")
                .arg(&uids)
                .arg("--payload")
                .arg(payload.to_string())
                .arg("--timeout-ms")
                .arg(timeout.as_millis().to_string());
        }
        processes.push(spawn_worker_process(&primary, command).await?);
    }
    info!("Started {} workers, dispatching '{}'", processes.len(), handler);

    let report = if timeout.is_zero() {
        report_rx.recv().await
    } else {
        tokio::time::timeout(timeout + REPORT_GRACE, report_rx.recv())
            .await
            .map_err(|_| anyhow!("no report from the originating worker"))?
    };
    let report = report.ok_or_else(|| anyhow!("primary stopped before a report arrived"))?;

    // Dropping the processes kills the workers.
    drop(processes);
    Ok(report)
}

/// Body of a worker process: serve commands over stdio until the primary
/// goes away, optionally originating one command first.
pub async fn run_worker(originate: Option<Originate>) -> anyhow::Result<()> {
    let link = stdio_link()?;
    let worker = ClusterWorker::start(link, worker_handlers());
    info!("Worker {} ready", worker.worker_id());

    if let Some(job) = originate {
        let report = match worker
            .send_command(
                &job.uids,
                ClusterConfig::ALL_WORKERS,
                &job.handler,
                job.payload,
                job.timeout,
            )
            .await
        {
            Ok(results) => json!({ "uids": job.uids, "results": results }),
            Err(err) => json!({ "uids": job.uids, "error": err.flatten() }),
        };
        worker
            .send_command(
                &format!("{}-report", job.uids),
                ClusterConfig::PRIMARY,
                REPORT_HANDLER,
                report,
                job.timeout,
            )
            .await?;
    }

    worker.run_until_detached().await;
    debug!("Worker detached, exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn in_process_cluster(size: usize) -> (PrimaryHandle, Vec<ClusterWorker>) {
        let primary = PrimaryHandle::start(CommandHandlers::new());
        let mut workers = Vec::new();
        for _ in 0..size {
            let link = primary.attach_worker().await.unwrap();
            workers.push(ClusterWorker::start(link, worker_handlers()));
        }
        (primary, workers)
    }

    #[tokio::test]
    async fn test_stats_reports_each_worker() {
        let (_primary, workers) = in_process_cluster(2).await;
        let results = workers[0]
            .send_command("stats-1", "*", "stats", Value::Null, Duration::from_secs(2))
            .await
            .unwrap();
        let ids: Vec<Value> = results.iter().map(|r| r.result["workerId"].clone()).collect();
        assert_eq!(ids, vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_fail_is_reported_not_raised() {
        let (_primary, workers) = in_process_cluster(2).await;
        let results = workers[1]
            .send_command("fail-1", "*", "fail", Value::Null, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(results
            .iter()
            .all(|r| r.error_code.as_deref() == Some("Refused")));
    }
}
