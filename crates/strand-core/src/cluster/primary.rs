//! Coordinating primary for cluster command fan-out.
//!
//! All primary state lives in one event task: the worker table, the handler
//! table for `PRIMARY` commands, and the two correlation maps keyed by
//! `uids`. Worker membership only changes inside that task, so the snapshot
//! taken for a `"*"` command is exactly the set the command is sent to.
//!
//! Command lifecycle on the primary:
//!
//! ```text
//! dispatched --report--> partially acknowledged (n of m) --last report--> complete
//!      |                          |
//!      +---- worker exits --------+--> slot filled with WorkerExited
//! ```

use super::protocol::{ClusterMessage, CommandOutcome, WorkerSelector};
use super::CommandHandlers;
use crate::error::{Result, RpcError};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Both ends of a worker's channel to the primary.
///
/// `inbound` carries what the primary sends to the worker; `outbound`
/// carries the worker's messages to the primary. Dropping every clone of
/// `outbound` detaches the worker.
pub struct WorkerLink {
    pub worker_id: u32,
    pub inbound: mpsc::UnboundedReceiver<ClusterMessage>,
    pub outbound: mpsc::UnboundedSender<ClusterMessage>,
}

enum PrimaryEvent {
    Attach {
        sender: mpsc::UnboundedSender<ClusterMessage>,
        reply: oneshot::Sender<u32>,
    },
    Detach {
        worker_id: u32,
    },
    FromWorker {
        worker_id: u32,
        message: ClusterMessage,
    },
    WorkerIds {
        reply: oneshot::Sender<Vec<u32>>,
    },
    InFlight {
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to a running primary. Dropping stops its event task.
pub struct PrimaryHandle {
    events: mpsc::UnboundedSender<PrimaryEvent>,
    task: Option<JoinHandle<()>>,
}

impl PrimaryHandle {
    /// Start the event task. `handlers` serve `PRIMARY` commands.
    pub fn start(handlers: CommandHandlers) -> Self {
        debug!("Primary serving handlers {:?}", handlers.names());
        let (events, events_rx) = mpsc::unbounded_channel();
        let state = PrimaryState {
            workers: BTreeMap::new(),
            next_worker_id: 1,
            handlers: Arc::new(handlers),
            uids_to_worker_id: HashMap::new(),
            uids_to_command_results: HashMap::new(),
        };
        let task = tokio::spawn(state.run(events_rx));
        Self {
            events,
            task: Some(task),
        }
    }

    /// Register a new worker and return its link.
    pub async fn attach_worker(&self) -> Result<WorkerLink> {
        let (to_worker, inbound) = mpsc::unbounded_channel();
        let (outbound, mut from_worker) = mpsc::unbounded_channel();
        let (reply, reply_rx) = oneshot::channel();
        self.events
            .send(PrimaryEvent::Attach {
                sender: to_worker,
                reply,
            })
            .map_err(|_| RpcError::PrimaryUnavailable)?;
        let worker_id = reply_rx.await.map_err(|_| RpcError::PrimaryUnavailable)?;

        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(message) = from_worker.recv().await {
                if events
                    .send(PrimaryEvent::FromWorker { worker_id, message })
                    .is_err()
                {
                    return;
                }
            }
            let _ = events.send(PrimaryEvent::Detach { worker_id });
        });

        Ok(WorkerLink {
            worker_id,
            inbound,
            outbound,
        })
    }

    /// Remove a worker explicitly, as if it had exited.
    pub fn detach_worker(&self, worker_id: u32) {
        let _ = self.events.send(PrimaryEvent::Detach { worker_id });
    }

    pub async fn worker_ids(&self) -> Result<Vec<u32>> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(PrimaryEvent::WorkerIds { reply })
            .map_err(|_| RpcError::PrimaryUnavailable)?;
        rx.await.map_err(|_| RpcError::PrimaryUnavailable)
    }

    /// Number of `"*"` commands still waiting for reports.
    pub async fn in_flight(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(PrimaryEvent::InFlight { reply })
            .map_err(|_| RpcError::PrimaryUnavailable)?;
        rx.await.map_err(|_| RpcError::PrimaryUnavailable)
    }
}

impl Drop for PrimaryHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct PrimaryState {
    workers: BTreeMap<u32, mpsc::UnboundedSender<ClusterMessage>>,
    next_worker_id: u32,
    handlers: Arc<CommandHandlers>,
    uids_to_worker_id: HashMap<String, u32>,
    /// Result slots per command, keyed and ordered by worker id.
    uids_to_command_results: HashMap<String, BTreeMap<u32, Option<CommandOutcome>>>,
}

impl PrimaryState {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<PrimaryEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                PrimaryEvent::Attach { sender, reply } => {
                    let worker_id = self.next_worker_id;
                    self.next_worker_id += 1;
                    self.workers.insert(worker_id, sender);
                    info!("Worker {} attached", worker_id);
                    let _ = reply.send(worker_id);
                }
                PrimaryEvent::Detach { worker_id } => self.on_worker_exit(worker_id),
                PrimaryEvent::FromWorker { worker_id, message } => {
                    self.on_worker_message(worker_id, message)
                }
                PrimaryEvent::WorkerIds { reply } => {
                    let _ = reply.send(self.workers.keys().copied().collect());
                }
                PrimaryEvent::InFlight { reply } => {
                    let _ = reply.send(self.uids_to_command_results.len());
                }
            }
        }
        debug!("Primary event loop stopped");
    }

    fn send_to(&self, worker_id: u32, message: ClusterMessage) {
        match self.workers.get(&worker_id) {
            Some(sender) => {
                if sender.send(message).is_err() {
                    debug!("Worker {} is gone, dropping message", worker_id);
                }
            }
            None => warn!(
                "Dropping {} for exited worker {}",
                describe(&message),
                worker_id
            ),
        }
    }

    fn on_worker_message(&mut self, worker_id: u32, message: ClusterMessage) {
        match message {
            ClusterMessage::Command {
                uids,
                to_workers,
                to_handler,
                payload,
            } => self.on_command(worker_id, uids, to_workers, to_handler, payload),
            ClusterMessage::CommandResult { uids, outcome } => {
                self.on_report(worker_id, uids, outcome)
            }
            other => warn!(
                "Ignoring {} from worker {}",
                describe(&other),
                worker_id
            ),
        }
    }

    fn on_command(
        &mut self,
        origin: u32,
        uids: String,
        to_workers: String,
        to_handler: String,
        payload: serde_json::Value,
    ) {
        let selector = match WorkerSelector::parse(&to_workers) {
            Ok(selector) => selector,
            Err(err) => {
                warn!("Command {} from worker {}: {}", uids, origin, err);
                self.send_to(
                    origin,
                    ClusterMessage::CommandError {
                        uids,
                        error: err.flatten(),
                    },
                );
                return;
            }
        };

        match selector {
            WorkerSelector::Primary => self.run_on_primary(origin, uids, to_handler, payload),
            WorkerSelector::All => {
                if self.uids_to_command_results.contains_key(&uids) {
                    let err = RpcError::DuplicateUids { uids: uids.clone() };
                    self.send_to(
                        origin,
                        ClusterMessage::CommandError {
                            uids,
                            error: err.flatten(),
                        },
                    );
                    return;
                }

                let slots: BTreeMap<u32, Option<CommandOutcome>> =
                    self.workers.keys().map(|id| (*id, None)).collect();
                debug!(
                    "Fanning out {} '{}' from worker {} to {} workers",
                    uids,
                    to_handler,
                    origin,
                    slots.len()
                );
                for worker_id in slots.keys() {
                    self.send_to(
                        *worker_id,
                        ClusterMessage::Command {
                            uids: uids.clone(),
                            to_workers: to_workers.clone(),
                            to_handler: to_handler.clone(),
                            payload: payload.clone(),
                        },
                    );
                }
                self.uids_to_worker_id.insert(uids.clone(), origin);
                self.uids_to_command_results.insert(uids.clone(), slots);
                self.try_complete(&uids);
            }
        }
    }

    /// Run a `PRIMARY` command off the event task and reply to the origin.
    fn run_on_primary(
        &self,
        origin: u32,
        uids: String,
        to_handler: String,
        payload: serde_json::Value,
    ) {
        let Some(sender) = self.workers.get(&origin).cloned() else {
            warn!("Dropping PRIMARY command {} from exited worker {}", uids, origin);
            return;
        };
        let handlers = self.handlers.clone();
        let env = super::CommandEnv {
            uids: uids.clone(),
            worker_id: None,
        };
        tokio::spawn(async move {
            let outcome = super::run_command(&handlers, &to_handler, env, payload).await;
            let _ = sender.send(ClusterMessage::CommandResult { uids, outcome });
        });
    }

    fn on_report(&mut self, worker_id: u32, uids: String, outcome: CommandOutcome) {
        let Some(slots) = self.uids_to_command_results.get_mut(&uids) else {
            debug!(
                "Dropping report from worker {} for unknown command {}",
                worker_id, uids
            );
            return;
        };
        match slots.get_mut(&worker_id) {
            None => {
                warn!(
                    "Dropping report for {} from worker {} outside the snapshot",
                    uids, worker_id
                );
                return;
            }
            Some(Some(_)) => {
                debug!(
                    "Dropping duplicate report for {} from worker {}",
                    uids, worker_id
                );
                return;
            }
            Some(slot) => *slot = Some(outcome),
        }
        self.try_complete(&uids);
    }

    fn on_worker_exit(&mut self, worker_id: u32) {
        if self.workers.remove(&worker_id).is_none() {
            return;
        }
        info!("Worker {} detached", worker_id);

        let mut affected = Vec::new();
        for (uids, slots) in self.uids_to_command_results.iter_mut() {
            match slots.get_mut(&worker_id) {
                Some(slot) if slot.is_none() => {
                    *slot = Some(CommandOutcome::failure(&RpcError::WorkerExited(worker_id)));
                    affected.push(uids.clone());
                }
                _ => {}
            }
        }
        for uids in affected {
            self.try_complete(&uids);
        }
    }

    fn try_complete(&mut self, uids: &str) {
        let complete = self
            .uids_to_command_results
            .get(uids)
            .map(|slots| slots.values().all(Option::is_some))
            .unwrap_or(false);
        if !complete {
            return;
        }
        let slots = self.uids_to_command_results.remove(uids).unwrap_or_default();
        let Some(origin) = self.uids_to_worker_id.remove(uids) else {
            return;
        };
        let results: Vec<CommandOutcome> = slots.into_values().flatten().collect();
        debug!("Command {} complete with {} results", uids, results.len());
        self.send_to(
            origin,
            ClusterMessage::CommandResults {
                uids: uids.to_string(),
                results,
            },
        );
    }
}

fn describe(message: &ClusterMessage) -> String {
    let kind = match message {
        ClusterMessage::Command { .. } => "command",
        ClusterMessage::CommandResult { .. } => "commandResult",
        ClusterMessage::CommandResults { .. } => "commandResults",
        ClusterMessage::CommandError { .. } => "commandError",
    };
    format!("{} {}", kind, message.uids())
}
