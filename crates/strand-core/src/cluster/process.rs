//! Cluster links over child-process stdio.
//!
//! The primary side spawns each worker as a child process and bridges its
//! [`WorkerLink`] onto the child's stdin/stdout; the child rebuilds a link
//! from its own stdio with [`stdio_link`]. Both directions use the
//! length-prefixed JSON framing of RPC connections, so a worker's stdout is
//! reserved for frames and logging must go to stderr.

use super::primary::{PrimaryHandle, WorkerLink};
use super::protocol::ClusterMessage;
use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use crate::rpc::protocol::{read_message, write_message};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Environment variable carrying the worker id into a worker process.
pub const WORKER_ID_ENV: &str = "STRAND_WORKER_ID";

/// A worker running as a child process. Dropping it kills the child.
pub struct WorkerProcess {
    worker_id: u32,
    child: Child,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerProcess {
    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub async fn wait(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait().await?)
    }

    pub async fn kill(&mut self) -> Result<()> {
        Ok(self.child.kill().await?)
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        let _ = self.child.start_kill();
    }
}

/// Attach a new worker to `primary` and run it as `command`.
///
/// The child exiting closes its stdout, which detaches the worker.
pub async fn spawn_worker_process(
    primary: &PrimaryHandle,
    mut command: Command,
) -> Result<WorkerProcess> {
    let WorkerLink {
        worker_id,
        inbound,
        outbound,
    } = primary.attach_worker().await?;

    command
        .env(WORKER_ID_ENV, worker_id.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .kill_on_drop(true);
    let mut child = command.spawn()?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| RpcError::Protocol("worker stdin not captured".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RpcError::Protocol("worker stdout not captured".to_string()))?;

    info!("Spawned worker {} (pid {:?})", worker_id, child.id());
    let tasks = bridge(stdout, stdin, outbound, inbound);
    Ok(WorkerProcess {
        worker_id,
        child,
        tasks,
    })
}

/// Worker-side link over this process's stdin/stdout.
pub fn stdio_link() -> Result<WorkerLink> {
    let raw = std::env::var(WORKER_ID_ENV)
        .map_err(|_| RpcError::Protocol(format!("{} is not set", WORKER_ID_ENV)))?;
    let worker_id = raw
        .parse::<u32>()
        .map_err(|_| RpcError::Protocol(format!("invalid {}: {}", WORKER_ID_ENV, raw)))?;
    Ok(io_link(worker_id, tokio::io::stdin(), tokio::io::stdout()))
}

/// Worker-side link over any byte transport.
pub fn io_link<R, W>(worker_id: u32, reader: R, writer: W) -> WorkerLink
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (inbound_tx, inbound) = mpsc::unbounded_channel();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    bridge(reader, writer, inbound_tx, outbound_rx);
    WorkerLink {
        worker_id,
        inbound,
        outbound,
    }
}

/// Pump frames from `reader` into `incoming` and from `outgoing` into
/// `writer`. Each direction stops at EOF or on the first error.
fn bridge<R, W>(
    mut reader: R,
    mut writer: W,
    incoming: mpsc::UnboundedSender<ClusterMessage>,
    mut outgoing: mpsc::UnboundedReceiver<ClusterMessage>,
) -> Vec<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let read_task = tokio::spawn(async move {
        loop {
            match read_message::<_, ClusterMessage>(&mut reader, RpcConfig::MAX_FRAME_SIZE).await {
                Ok(Some(message)) => {
                    if incoming.send(message).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("Cluster link closed by peer");
                    break;
                }
                Err(err) => {
                    warn!("Cluster link read failed: {}", err);
                    break;
                }
            }
        }
    });
    let write_task = tokio::spawn(async move {
        while let Some(message) = outgoing.recv().await {
            if let Err(err) = write_message(&mut writer, &message).await {
                warn!("Cluster link write failed: {}", err);
                break;
            }
        }
    });
    vec![read_task, write_task]
}
