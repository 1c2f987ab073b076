//! Worker side of cluster command fan-out.
//!
//! A [`ClusterWorker`] plays two parts: it runs commands the primary
//! forwards to it, and it originates commands of its own through
//! [`ClusterWorker::send_command`], keeping one pending entry per in-flight
//! `uids`.

use super::primary::WorkerLink;
use super::protocol::{ClusterMessage, CommandOutcome};
use super::{run_command, CommandEnv, CommandHandlers};
use crate::error::{Result, RpcError};
use crate::util::lock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

type CommandReply = oneshot::Sender<Result<Vec<CommandOutcome>>>;
type PendingCommands = Mutex<HashMap<String, CommandReply>>;

pub struct ClusterWorker {
    worker_id: u32,
    outbound: mpsc::UnboundedSender<ClusterMessage>,
    pending: Arc<PendingCommands>,
    task: Option<JoinHandle<()>>,
}

impl ClusterWorker {
    /// Start serving forwarded commands over `link`.
    pub fn start(link: WorkerLink, handlers: CommandHandlers) -> Self {
        let WorkerLink {
            worker_id,
            inbound,
            outbound,
        } = link;
        let pending = Arc::new(Mutex::new(HashMap::new()));
        let task = tokio::spawn(run(
            worker_id,
            inbound,
            outbound.clone(),
            handlers,
            pending.clone(),
        ));
        Self {
            worker_id,
            outbound,
            pending,
            task: Some(task),
        }
    }

    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    /// Commands this worker originated that have not completed.
    pub fn in_flight(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Ask the primary to run `to_handler` on `to_workers`.
    ///
    /// Resolves with every worker's outcome for `"*"`, or the single primary
    /// outcome for `"PRIMARY"`. A `uids` already in flight is rejected
    /// without sending anything. A zero `timeout` waits forever.
    pub async fn send_command(
        &self,
        uids: &str,
        to_workers: &str,
        to_handler: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Vec<CommandOutcome>> {
        let rx = {
            let mut pending = lock(&self.pending);
            if pending.contains_key(uids) {
                return Err(RpcError::DuplicateUids {
                    uids: uids.to_string(),
                });
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(uids.to_string(), tx);
            rx
        };

        let command = ClusterMessage::Command {
            uids: uids.to_string(),
            to_workers: to_workers.to_string(),
            to_handler: to_handler.to_string(),
            payload,
        };
        if self.outbound.send(command).is_err() {
            lock(&self.pending).remove(uids);
            return Err(RpcError::PrimaryUnavailable);
        }

        let outcome = if timeout.is_zero() {
            rx.await
        } else {
            match tokio::time::timeout(timeout, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    lock(&self.pending).remove(uids);
                    debug!("Command {} timed out after {:?}", uids, timeout);
                    return Err(RpcError::CommandTimeout {
                        uids: uids.to_string(),
                        timeout,
                    });
                }
            }
        };
        outcome.unwrap_or(Err(RpcError::PrimaryUnavailable))
    }

    /// Serve until the primary goes away.
    pub async fn run_until_detached(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ClusterWorker {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn resolve(pending: &PendingCommands, uids: &str, outcome: Result<Vec<CommandOutcome>>) {
    match lock(pending).remove(uids) {
        Some(reply) => {
            let _ = reply.send(outcome);
        }
        None => debug!("Dropping late or unknown reply for command {}", uids),
    }
}

async fn run(
    worker_id: u32,
    mut inbound: mpsc::UnboundedReceiver<ClusterMessage>,
    outbound: mpsc::UnboundedSender<ClusterMessage>,
    handlers: CommandHandlers,
    pending: Arc<PendingCommands>,
) {
    let handlers = Arc::new(handlers);
    // Handler tasks live in the set so stopping the worker stops them too.
    let mut running = JoinSet::new();
    loop {
        let message = tokio::select! {
            message = inbound.recv() => message,
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(err) = joined {
                    warn!("Worker {} command task failed: {}", worker_id, err);
                }
                continue;
            }
        };
        let Some(message) = message else { break };
        match message {
            ClusterMessage::Command {
                uids,
                to_handler,
                payload,
                ..
            } => {
                let handlers = handlers.clone();
                let outbound = outbound.clone();
                let env = CommandEnv {
                    uids: uids.clone(),
                    worker_id: Some(worker_id),
                };
                running.spawn(async move {
                    let outcome = run_command(&handlers, &to_handler, env, payload).await;
                    let _ = outbound.send(ClusterMessage::CommandResult { uids, outcome });
                });
            }
            ClusterMessage::CommandResults { uids, results } => {
                resolve(&pending, &uids, Ok(results))
            }
            ClusterMessage::CommandResult { uids, outcome } => {
                resolve(&pending, &uids, Ok(vec![outcome]))
            }
            ClusterMessage::CommandError { uids, error } => {
                resolve(&pending, &uids, Err(RpcError::from_flat(error)))
            }
        }
    }

    debug!("Worker {} lost its primary", worker_id);
    let orphaned: Vec<_> = lock(&pending).drain().collect();
    for (_, reply) in orphaned {
        let _ = reply.send(Err(RpcError::PrimaryUnavailable));
    }
}
