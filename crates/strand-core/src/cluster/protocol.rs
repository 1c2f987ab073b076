//! Cluster command messages exchanged between the primary and its workers.
//!
//! They travel in-process over channels, or between processes with the same
//! length-prefixed JSON framing as RPC connections.

use crate::config::ClusterConfig;
use crate::error::{FlatError, Result, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClusterMessage {
    /// Worker to primary to ask for a fan-out; primary to worker to run it.
    #[serde(rename = "cluster-rpc:command")]
    Command {
        uids: String,
        to_workers: String,
        to_handler: String,
        #[serde(default)]
        payload: Value,
    },
    /// One handler outcome: a worker's report, or the primary's own reply.
    #[serde(rename = "cluster-rpc:commandResult")]
    CommandResult {
        uids: String,
        #[serde(flatten)]
        outcome: CommandOutcome,
    },
    /// Aggregate sent to the originating worker.
    #[serde(rename = "cluster-rpc:commandResults")]
    CommandResults {
        uids: String,
        results: Vec<CommandOutcome>,
    },
    /// The command as a whole failed.
    #[serde(rename = "cluster-rpc:commandError")]
    CommandError { uids: String, error: FlatError },
}

impl ClusterMessage {
    pub fn uids(&self) -> &str {
        match self {
            ClusterMessage::Command { uids, .. }
            | ClusterMessage::CommandResult { uids, .. }
            | ClusterMessage::CommandResults { uids, .. }
            | ClusterMessage::CommandError { uids, .. } => uids,
        }
    }
}

/// Result of running one command handler.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutcome {
    #[serde(default)]
    pub error: Option<FlatError>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub result: Value,
}

impl CommandOutcome {
    pub fn success(result: Value) -> Self {
        Self {
            error: None,
            error_code: None,
            result,
        }
    }

    pub fn failure(err: &RpcError) -> Self {
        Self {
            error: Some(err.flatten()),
            error_code: Some(err.code()),
            result: Value::Null,
        }
    }

    pub fn from_result(result: Result<Value>) -> Self {
        match result {
            Ok(value) => Self::success(value),
            Err(err) => Self::failure(&err),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Turn the outcome back into a `Result`, rebuilding the error.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(flat) => Err(RpcError::from_flat(flat)),
            None => Ok(self.result),
        }
    }
}

/// Which workers a command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSelector {
    /// Every worker registered when the primary dispatches the command.
    All,
    /// The primary's own handler table.
    Primary,
}

impl WorkerSelector {
    pub fn parse(selector: &str) -> Result<Self> {
        match selector {
            ClusterConfig::ALL_WORKERS => Ok(WorkerSelector::All),
            ClusterConfig::PRIMARY => Ok(WorkerSelector::Primary),
            other => Err(RpcError::InvalidSelector(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerSelector::All => ClusterConfig::ALL_WORKERS,
            WorkerSelector::Primary => ClusterConfig::PRIMARY,
        }
    }
}

impl std::fmt::Display for WorkerSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
