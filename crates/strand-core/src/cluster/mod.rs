//! Cluster command fan-out between a primary and its workers.
//!
//! A worker asks the primary to run a named command either on the primary
//! itself (`"PRIMARY"`) or on every registered worker (`"*"`). In the second
//! case the primary aggregates one outcome per worker and returns the whole
//! array to the originating worker.

pub mod primary;
pub mod process;
pub mod protocol;
pub mod worker;

pub use primary::{PrimaryHandle, WorkerLink};
pub use process::{io_link, spawn_worker_process, stdio_link, WorkerProcess, WORKER_ID_ENV};
pub use protocol::{ClusterMessage, CommandOutcome, WorkerSelector};
pub use worker::ClusterWorker;

use crate::error::{Result, RpcError};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::warn;

/// What a command handler knows about the command it runs.
#[derive(Debug, Clone)]
pub struct CommandEnv {
    pub uids: String,
    /// The worker running the handler; `None` on the primary.
    pub worker_id: Option<u32>,
}

pub type CommandHandler =
    Arc<dyn Fn(CommandEnv, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Named command handlers, shared by the primary and each worker.
#[derive(Clone, Default)]
pub struct CommandHandlers {
    handlers: HashMap<String, CommandHandler>,
}

impl CommandHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(CommandEnv, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: CommandHandler = Arc::new(move |env, payload| f(env, payload).boxed());
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<CommandHandler> {
        self.handlers.get(name).cloned()
    }

    /// Registered handler names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Run `name` from `handlers` and turn whatever happens into an outcome.
///
/// A missing handler is `NotImplemented` and a panic is `HandlerPanic`, so
/// every command produces exactly one report.
pub(crate) async fn run_command(
    handlers: &CommandHandlers,
    name: &str,
    env: CommandEnv,
    payload: Value,
) -> CommandOutcome {
    let Some(handler) = handlers.get(name) else {
        warn!("No command handler '{}' for {}", name, env.uids);
        return CommandOutcome::failure(&RpcError::NotImplemented(name.to_string()));
    };
    let uids = env.uids.clone();
    let run = async move { handler(env, payload).await };
    match AssertUnwindSafe(run).catch_unwind().await {
        Ok(result) => CommandOutcome::from_result(result),
        Err(_) => {
            warn!("Command handler '{}' panicked while running {}", name, uids);
            CommandOutcome::failure(&RpcError::handler_panicked(name))
        }
    }
}
